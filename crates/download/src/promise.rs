//! Single-assignment value cells shared between pipeline stages.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::DownloadError;

enum Slot<T> {
    Pending,
    Ready(T),
    Failed(DownloadError),
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Clonable handle to a value fulfilled at most once.
///
/// This is the "previous output" linkage between adjacent tasks: a task
/// clones its predecessor's handle at construction, and a later rewire
/// of the predecessor (after a processing failure) leaves this clone
/// pointing at the failed cell, propagating the failure downstream.
pub struct Shared<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Clone> Shared<T> {
    pub(crate) fn pending() -> Self {
        Self {
            cell: Arc::new(Cell {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// A cell that is already fulfilled, used to seed the head of a
    /// pipeline.
    pub fn ready(value: T) -> Self {
        Self {
            cell: Arc::new(Cell {
                slot: Mutex::new(Slot::Ready(value)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks until the cell is fulfilled.
    pub fn get(&self) -> Result<T, DownloadError> {
        let mut slot = self.cell.slot.lock();
        loop {
            match &*slot {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::Failed(e) => return Err(e.clone()),
                Slot::Pending => self.cell.cond.wait(&mut slot),
            }
        }
    }

    /// Non-blocking read.
    pub fn try_get(&self) -> Option<Result<T, DownloadError>> {
        match &*self.cell.slot.lock() {
            Slot::Ready(v) => Some(Ok(v.clone())),
            Slot::Failed(e) => Some(Err(e.clone())),
            Slot::Pending => None,
        }
    }

    /// Fulfils the cell.  Returns false if it was already resolved.
    pub(crate) fn fulfill(&self, value: T) -> bool {
        let mut slot = self.cell.slot.lock();
        if !matches!(&*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.cell.cond.notify_all();
        true
    }

    /// Records a failure.  Returns false if the cell was already
    /// resolved.
    pub(crate) fn fail(&self, err: DownloadError) -> bool {
        let mut slot = self.cell.slot.lock();
        if !matches!(&*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Failed(err);
        self.cell.cond.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfill_once() {
        let cell = Shared::pending();
        assert_eq!(cell.try_get(), None);
        assert!(cell.fulfill(5));
        assert!(!cell.fulfill(6));
        assert_eq!(cell.get(), Ok(5));
    }

    #[test]
    fn test_failure_visible_to_clones() {
        let cell: Shared<u32> = Shared::pending();
        let observer = cell.clone();
        assert!(cell.fail(DownloadError::Cancelled));
        assert_eq!(observer.get(), Err(DownloadError::Cancelled));
    }

    #[test]
    fn test_get_wakes_blocked_reader() {
        let cell: Shared<u32> = Shared::pending();
        let reader = cell.clone();
        let handle = std::thread::spawn(move || reader.get());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(cell.fulfill(7));
        assert_eq!(handle.join().unwrap(), Ok(7));
    }
}
