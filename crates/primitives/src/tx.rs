//! Transaction-level identifiers.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::buf::Buf32;

/// Reference to a previously created transaction output.
///
/// Ordering is lexicographic over the txid bytes and then the output
/// index, matching the order of the 36-byte wire form.
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
pub struct Outpoint {
    txid: Buf32,
    index: u32,
}

impl Outpoint {
    pub fn new(txid: Buf32, index: u32) -> Self {
        Self { txid, index }
    }

    pub fn txid(&self) -> &Buf32 {
        &self.txid
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The 36-byte wire form, txid then LE index.  Used both as a
    /// database key and as a cfilter element for the outpoint-carrying
    /// filter types.
    pub fn serialize(&self) -> [u8; 36] {
        let mut buf = [0u8; 36];
        buf[..32].copy_from_slice(self.txid.as_slice());
        buf[32..].copy_from_slice(&self.index.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() != 36 {
            return None;
        }
        let txid = Buf32::try_from(&data[..32]).ok()?;
        let index = u32::from_le_bytes(data[32..].try_into().ok()?);
        Some(Self { txid, index })
    }
}

impl From<bitcoin::OutPoint> for Outpoint {
    fn from(value: bitcoin::OutPoint) -> Self {
        Self {
            txid: value.txid.into(),
            index: value.vout,
        }
    }
}

impl From<Outpoint> for bitcoin::OutPoint {
    fn from(value: Outpoint) -> Self {
        bitcoin::OutPoint {
            txid: value.txid.into(),
            vout: value.index,
        }
    }
}

impl std::fmt::Display for Outpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outpoint_wire_round_trip() {
        let op = Outpoint::new(Buf32::from([3; 32]), 7);
        let wire = op.serialize();
        assert_eq!(wire.len(), 36);
        assert_eq!(&wire[32..], &[7, 0, 0, 0]);
        assert_eq!(Outpoint::deserialize(&wire), Some(op));
        assert_eq!(Outpoint::deserialize(&wire[..35]), None);
    }

    #[test]
    fn test_outpoint_ordering_matches_wire_form() {
        let a = Outpoint::new(Buf32::from([1; 32]), 9);
        let b = Outpoint::new(Buf32::from([2; 32]), 0);
        let c = Outpoint::new(Buf32::from([2; 32]), 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_outpoint_borsh_round_trip() {
        let generator = cinder_test_utils::ArbitraryGenerator::new();
        for _ in 0..16 {
            let outpoint: Outpoint = generator.generate();
            let encoded = borsh::to_vec(&outpoint).unwrap();
            assert_eq!(borsh::from_slice::<Outpoint>(&encoded).unwrap(), outpoint);
        }
    }
}
