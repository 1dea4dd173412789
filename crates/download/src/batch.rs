use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cinder_primitives::block::BlockPosition;

use crate::manager::{DownloadSink, ManagerShared, TaskOf};

/// A contiguous slice of tasks handed to one download worker.
///
/// The batch shares its tasks with the manager's buffer.  When the
/// batch is dropped the manager is notified so that tasks which never
/// finished downloading are returned to the allocatable pool.
pub struct Batch<S: DownloadSink> {
    id: i64,
    tasks: Vec<Arc<TaskOf<S>>>,
    index: HashMap<BlockPosition, usize>,
    extra: S::Extra,
    downloaded: Mutex<usize>,
    last_activity: Mutex<Instant>,
    manager: Weak<ManagerShared<S>>,
}

impl<S: DownloadSink> Batch<S> {
    pub(crate) fn new(
        id: i64,
        tasks: Vec<Arc<TaskOf<S>>>,
        extra: S::Extra,
        manager: Weak<ManagerShared<S>>,
    ) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (*task.position(), i))
            .collect();

        Self {
            id,
            tasks,
            index,
            extra,
            downloaded: Mutex::new(0),
            last_activity: Mutex::new(Instant::now()),
            manager,
        }
    }

    /// An empty batch, handed out when the pipeline is caught up.
    pub(crate) fn empty(extra: S::Extra) -> Self {
        Self::new(-1, Vec::new(), extra, Weak::new())
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Arc<TaskOf<S>>] {
        &self.tasks
    }

    pub fn extra(&self) -> &S::Extra {
        &self.extra
    }

    /// Time since the last successful download into this batch.
    pub fn elapsed(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether every task in the batch accepted its payload.
    pub fn is_downloaded(&self) -> bool {
        let size = self.tasks.len();
        size > 0 && *self.downloaded.lock() == size
    }

    /// Routes a payload to the task at `position`.
    pub fn download(
        &self,
        position: &BlockPosition,
        data: S::Download,
        check: Option<&S::Extra>,
    ) -> bool {
        let Some(task) = self.index.get(position).map(|i| &self.tasks[*i]) else {
            return false;
        };

        if task.download(data, check) {
            *self.downloaded.lock() += 1;
            *self.last_activity.lock() = Instant::now();
            return true;
        }

        false
    }
}

impl<S: DownloadSink> Drop for Batch<S> {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.finish_downloading(&self.tasks);
        }
    }
}
