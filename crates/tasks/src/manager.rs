use std::panic;
use std::thread;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::*;

use crate::shutdown::{ShutdownGuard, ShutdownSignal};

/// Terminal outcome of a critical task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("critical task {0} panicked: {1}")]
    Panic(String, String),

    #[error("critical task {0} exited with error: {1}")]
    Failed(String, String),
}

/// Owns the shutdown signal and observes critical task exits.
pub struct TaskManager {
    signal: ShutdownSignal,
    failure_tx: mpsc::UnboundedSender<TaskError>,
    failure_rx: mpsc::UnboundedReceiver<TaskError>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Self {
            signal: ShutdownSignal::new(),
            failure_tx,
            failure_rx,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            signal: self.signal.clone(),
            failure_tx: self.failure_tx.clone(),
        }
    }

    /// Blocks until a critical task fails, then fires the shutdown
    /// signal and returns the failure.  Returns `None` if every
    /// executor handle was dropped without a failure.
    pub fn monitor_blocking(&mut self) -> Option<TaskError> {
        let failure = self.failure_rx.blocking_recv();
        if let Some(err) = &failure {
            error!(%err, "critical task failed, shutting down");
        }
        self.signal.send();
        failure
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle for spawning critical worker threads.
#[derive(Clone)]
pub struct TaskExecutor {
    signal: ShutdownSignal,
    failure_tx: mpsc::UnboundedSender<TaskError>,
}

impl TaskExecutor {
    pub fn shutdown_guard(&self) -> ShutdownGuard {
        self.signal.subscribe()
    }

    /// Spawns a blocking worker thread whose panic or error escalates to
    /// the manager.
    pub fn spawn_critical<F>(&self, name: &'static str, f: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.signal.subscribe();
        let failure_tx = self.failure_tx.clone();

        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| f(guard)));
                match outcome {
                    Ok(Ok(())) => {
                        debug!(%name, "critical task exited cleanly");
                    }
                    Ok(Err(e)) => {
                        let _ = failure_tx.send(TaskError::Failed(name.into(), e.to_string()));
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        let _ = failure_tx.send(TaskError::Panic(name.into(), msg));
                    }
                }
            })
            .expect("tasks: spawn worker thread")
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_escalates() {
        let mut manager = TaskManager::new();
        let exec = manager.executor();
        let guard = exec.shutdown_guard();

        exec.spawn_critical("failing", |_| Err(anyhow::anyhow!("boom")));

        let failure = manager.monitor_blocking().expect("expected failure");
        assert!(matches!(failure, TaskError::Failed(name, _) if name == "failing"));
        assert!(guard.should_shutdown());
    }

    #[test]
    fn test_panic_escalates() {
        let mut manager = TaskManager::new();
        let exec = manager.executor();

        exec.spawn_critical("panicking", |_| panic!("kaboom"));

        let failure = manager.monitor_blocking().expect("expected failure");
        assert!(matches!(failure, TaskError::Panic(name, msg) if name == "panicking" && msg.contains("kaboom")));
    }
}
