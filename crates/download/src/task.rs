use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::*;

use cinder_primitives::block::BlockPosition;

use crate::promise::Shared;
use crate::DownloadError;

/// Pipeline stage of one task.
///
/// `Update` is a transient intermediate held only for the duration of a
/// compare-and-swap critical section, so that concurrent observers see a
/// single linearisation of every transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskState {
    New = 0,
    Downloading = 1,
    Downloaded = 2,
    Processing = 3,
    Processed = 4,
    Update = 5,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Downloading,
            2 => Self::Downloaded,
            3 => Self::Processing,
            4 => Self::Processed,
            5 => Self::Update,
            _ => unreachable!("task: invalid state {raw}"),
        }
    }
}

/// One block position's worth of work.
///
/// The download payload and the processed output are single-assignment
/// cells; `previous` is a clone of the predecessor task's output handle
/// taken at construction time.
pub struct Task<D, F, X> {
    position: BlockPosition,
    extra: X,
    id: u64,
    state: AtomicU8,
    download: Mutex<Shared<D>>,
    output: Mutex<Shared<F>>,
    previous: Shared<F>,
}

impl<D: Clone, F: Clone, X: Clone + PartialEq> Task<D, F, X> {
    pub(crate) fn new(position: BlockPosition, previous: Shared<F>, extra: X, id: u64) -> Self {
        Self {
            position,
            extra,
            id,
            state: AtomicU8::new(TaskState::New as u8),
            download: Mutex::new(Shared::pending()),
            output: Mutex::new(Shared::pending()),
            previous,
        }
    }

    pub fn position(&self) -> &BlockPosition {
        &self.position
    }

    pub fn extra(&self) -> &X {
        &self.extra
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Handle to the download payload cell.
    pub fn data(&self) -> Shared<D> {
        self.download.lock().clone()
    }

    /// Handle to the processed output cell.
    pub fn output(&self) -> Shared<F> {
        self.output.lock().clone()
    }

    /// Handle to the predecessor's processed output.
    pub fn previous(&self) -> &Shared<F> {
        &self.previous
    }

    /// Claims a `New` task for download.  Used by sinks that can
    /// pre-resolve payloads from local storage during `check_task`.
    pub fn try_claim(&self) -> bool {
        self.cas(TaskState::New, TaskState::Downloading)
    }

    pub(crate) fn cas(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Records the downloaded payload.
    ///
    /// Fails (and leaves the task downloadable) if the task is not in
    /// the `Downloading` state or if `check` disagrees with the task's
    /// metadata.
    pub fn download(&self, data: D, check: Option<&X>) -> bool {
        if !self.cas(TaskState::Downloading, TaskState::Update) {
            trace!(
                id = self.id,
                position = %self.position,
                "download failed state check"
            );
            return false;
        }

        if let Some(check) = check {
            if *check != self.extra {
                trace!(
                    id = self.id,
                    position = %self.position,
                    "download failed metadata check"
                );
                self.set_state(TaskState::Downloading);
                return false;
            }
        }

        let fulfilled = self.download.lock().fulfill(data);
        debug_assert!(fulfilled, "task: download cell fulfilled twice");
        self.set_state(TaskState::Downloaded);
        trace!(id = self.id, position = %self.position, "download complete");

        true
    }

    /// Completes processing with a result, or records a failure and
    /// rewires the task for redownload.
    ///
    /// On failure the old output cell observes the error (propagating to
    /// any successor holding a clone of it) and both cells are replaced
    /// with fresh unfulfilled ones.
    pub fn process(&self, result: Result<F, DownloadError>) {
        if !self.cas(TaskState::Processing, TaskState::Update) {
            return;
        }

        match result {
            Ok(data) => {
                let fulfilled = self.output.lock().fulfill(data);
                debug_assert!(fulfilled, "task: output cell fulfilled twice");
                self.set_state(TaskState::Processed);
                trace!(id = self.id, position = %self.position, "processing complete");
            }
            Err(err) => {
                debug!(
                    id = self.id,
                    position = %self.position,
                    %err,
                    "processing failed, redownloading"
                );
                {
                    let mut output = self.output.lock();
                    output.fail(err);
                    *output = Shared::pending();
                }
                *self.download.lock() = Shared::pending();
                self.set_state(TaskState::New);
            }
        }
    }

    /// Returns the task to `New` with a fresh download cell, without
    /// touching the output cell.
    ///
    /// Call this instead of (never after) `process` when the downloaded
    /// payload itself was unusable.
    pub fn redownload(&self) {
        if !self.cas(TaskState::Processing, TaskState::Update) {
            return;
        }

        debug!(id = self.id, position = %self.position, "redownloading");
        *self.download.lock() = Shared::pending();
        self.set_state(TaskState::New);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_primitives::buf::Buf32;

    fn task() -> Task<u32, String, u8> {
        Task::new(
            BlockPosition::new(4, Buf32::from([4; 32])),
            Shared::ready("seed".to_owned()),
            0,
            0,
        )
    }

    #[test]
    fn test_download_requires_downloading_state() {
        let t = task();
        assert_eq!(t.state(), TaskState::New);
        assert!(!t.download(11, None));
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(t.download(11, None));
        assert_eq!(t.state(), TaskState::Downloaded);
        assert_eq!(t.data().try_get(), Some(Ok(11)));
        // Second fulfilment refused.
        assert!(!t.download(12, None));
    }

    #[test]
    fn test_download_metadata_check() {
        let t = task();
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(!t.download(11, Some(&1)));
        assert_eq!(t.state(), TaskState::Downloading);
        assert!(t.download(11, Some(&0)));
    }

    #[test]
    fn test_process_success() {
        let t = task();
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(t.download(11, None));
        assert!(t.cas(TaskState::Downloaded, TaskState::Processing));
        t.process(Ok("out".to_owned()));
        assert_eq!(t.state(), TaskState::Processed);
        assert_eq!(t.output().try_get(), Some(Ok("out".to_owned())));
    }

    #[test]
    fn test_process_failure_rewires() {
        let t = task();
        let old_output = t.output();
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(t.download(11, None));
        assert!(t.cas(TaskState::Downloaded, TaskState::Processing));

        t.process(Err(DownloadError::Missing("gone".into())));

        assert_eq!(t.state(), TaskState::New);
        // The pre-failure handle observes the error, the fresh cells do
        // not.
        assert!(matches!(old_output.try_get(), Some(Err(_))));
        assert_eq!(t.output().try_get(), None);
        assert_eq!(t.data().try_get(), None);
    }

    #[test]
    fn test_redownload_preserves_output_cell() {
        let t = task();
        let output = t.output();
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(t.download(11, None));
        assert!(t.cas(TaskState::Downloaded, TaskState::Processing));

        t.redownload();

        assert_eq!(t.state(), TaskState::New);
        assert_eq!(t.data().try_get(), None);
        assert_eq!(output.try_get(), None);

        // The task can complete after the retry.
        assert!(t.cas(TaskState::New, TaskState::Downloading));
        assert!(t.download(13, None));
        assert!(t.cas(TaskState::Downloaded, TaskState::Processing));
        t.process(Ok("retried".to_owned()));
        assert_eq!(output.try_get(), Some(Ok("retried".to_owned())));
    }
}
