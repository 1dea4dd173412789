//! Block position types for the chains we scan.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::buf::Buf32;

/// Block height.  Negative only for the blank position.
pub type Height = i64;

/// A block's position on a chain, the pair of its height and hash.
///
/// Positions are totally ordered by height and then by hash, which gives
/// a stable order for siblings at the same height.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
pub struct BlockPosition {
    height: Height,
    hash: Buf32,
}

impl BlockPosition {
    pub fn new(height: Height, hash: Buf32) -> Self {
        Self { height, hash }
    }

    /// The position "before genesis", used to seed empty chains.
    pub fn blank() -> Self {
        Self {
            height: -1,
            hash: Buf32::zero(),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn hash(&self) -> &Buf32 {
        &self.hash
    }

    pub fn is_blank(&self) -> bool {
        self.height < 0
    }

    /// Serializes to the persisted wire form, LE height then hash.
    pub fn serialize(&self) -> [u8; 40] {
        let mut buf = [0u8; 40];
        buf[..8].copy_from_slice(&self.height.to_le_bytes());
        buf[8..].copy_from_slice(self.hash.as_slice());
        buf
    }
}

impl std::fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let a = BlockPosition::new(5, Buf32::from([1; 32]));
        let b = BlockPosition::new(5, Buf32::from([2; 32]));
        let c = BlockPosition::new(6, Buf32::from([0; 32]));
        assert!(a < b);
        assert!(b < c);
        assert!(BlockPosition::blank() < a);
    }

    #[test]
    fn test_position_wire_form() {
        let pos = BlockPosition::new(0x0102, Buf32::from([0xaa; 32]));
        let wire = pos.serialize();
        assert_eq!(&wire[..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&wire[8..], &[0xaa; 32]);
    }
}
