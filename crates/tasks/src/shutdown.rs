use tokio::sync::watch;

/// Sender half used to request shutdown of every listening task.
#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(tx)
    }

    /// Fires the signal.  Idempotent.
    pub fn send(&self) {
        // Error only if every receiver is gone, which is fine.
        let _ = self.0.send(true);
    }

    pub fn subscribe(&self) -> ShutdownGuard {
        ShutdownGuard(self.0.subscribe())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half checked by tasks between units of work.
#[derive(Clone, Debug)]
pub struct ShutdownGuard(watch::Receiver<bool>);

impl ShutdownGuard {
    /// Non-blocking check for whether shutdown was requested.
    pub fn should_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once shutdown is requested.
    pub async fn wait_for_shutdown(&mut self) {
        // Wait for the value to flip; a closed channel also means the
        // manager is gone and we should stop.
        let _ = self.0.wait_for(|v| *v).await;
    }
}
