//! Shared helpers for generating test data.

use std::sync::atomic::{AtomicUsize, Ordering};

use arbitrary::{Arbitrary, Unstructured};
use rand::{rngs::OsRng, RngCore};

/// Size of the entropy pool backing one generator instance.
const ARB_GEN_LEN: usize = 1 << 20;

/// Source of arbitrary values for tests.
///
/// Each call to [`Self::generate`] consumes bytes from a shared entropy
/// pool, so successive values produced by one generator are independent.
pub struct ArbitraryGenerator {
    buf: Vec<u8>,
    off: AtomicUsize,
}

impl Default for ArbitraryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbitraryGenerator {
    pub fn new() -> Self {
        Self::new_with_size(ARB_GEN_LEN)
    }

    pub fn new_with_size(n: usize) -> Self {
        let mut buf = vec![0; n];
        OsRng.fill_bytes(&mut buf);
        Self {
            buf,
            off: AtomicUsize::new(0),
        }
    }

    pub fn generate<'a, T: Arbitrary<'a> + Clone>(&'a self) -> T {
        let off = self.off.load(Ordering::Relaxed);
        let mut u = Unstructured::new(&self.buf[off..]);
        let elem = T::arbitrary(&mut u).expect("failed to generate arbitrary instance");
        let consumed = self.buf.len() - off - u.len();
        self.off.store(off + consumed, Ordering::Relaxed);
        elem
    }
}
