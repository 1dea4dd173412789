//! Golomb-coded-set filters in the BIP-158 family.
//!
//! A filter commits to a set of byte elements by hashing each into a
//! numeric range sized by the element count and the false positive
//! parameter `M`, then Golomb-Rice coding the sorted deltas with bit
//! parameter `P`.  Membership queries hash the probe the same way and
//! walk the coded stream.

mod bits;
mod filter;

pub use bits::{BitReader, BitWriter};
pub use filter::{Gcs, GcsKey};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcsError {
    #[error("filter bit stream ended prematurely")]
    UnexpectedEof,

    #[error("malformed element count prefix")]
    BadPrefix,

    #[error("element count {0} exceeds the maximum {1}")]
    TooManyElements(u64, u64),

    #[error("element set contains an empty element")]
    EmptyElement,
}
