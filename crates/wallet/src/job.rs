use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounds the number of in-flight background jobs across subchains.
///
/// Claim a slot with [`Self::try_claim`]; the returned guard returns
/// the slot when dropped.
#[derive(Clone)]
pub struct JobCounter {
    running: Arc<AtomicUsize>,
    limit: usize,
}

pub struct JobGuard {
    running: Arc<AtomicUsize>,
}

impl JobCounter {
    pub fn new(limit: usize) -> Self {
        Self {
            running: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn try_claim(&self) -> Option<JobGuard> {
        let mut current = self.running.load(Ordering::SeqCst);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.running.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(JobGuard {
                        running: self.running.clone(),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let counter = JobCounter::new(2);
        let a = counter.try_claim().unwrap();
        let _b = counter.try_claim().unwrap();
        assert!(counter.try_claim().is_none());
        assert_eq!(counter.running(), 2);

        drop(a);
        assert!(counter.try_claim().is_some());
    }
}
