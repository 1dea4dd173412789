//! Compact block filter types.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// The kind of compact block filter a chain serves.
///
/// Discriminants are the BIP-158 wire values; `Es` is the extended
/// filter variant with a lower false positive rate.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    Arbitrary,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum FilterType {
    /// BIP-158 basic filter, script elements only.
    Basic = 0,
    /// The BCH flavor of the basic filter, which additionally commits to
    /// the outpoints consumed by the block.
    BasicBch = 1,
    /// Extended filter with 2^-22 false positive rate.
    Es = 88,
}

impl FilterType {
    /// Golomb-Rice bit parameter for this filter type.
    pub fn p(&self) -> u8 {
        match self {
            Self::Basic | Self::BasicBch => 19,
            Self::Es => 23,
        }
    }

    /// False positive rate denominator for this filter type.
    pub fn m(&self) -> u32 {
        match self {
            Self::Basic | Self::BasicBch => 784_931,
            Self::Es => 1 << 22,
        }
    }

    /// Whether elements for this filter type include consumed outpoints
    /// in addition to script data.
    pub fn includes_outpoints(&self) -> bool {
        matches!(self, Self::BasicBch | Self::Es)
    }
}

impl BorshSerialize for FilterType {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        u8::from(*self).serialize(writer)
    }
}

impl BorshDeserialize for FilterType {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let raw = u8::deserialize_reader(reader)?;
        Self::try_from(raw).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown filter type {raw}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(u8::from(FilterType::Basic), 0);
        assert_eq!(u8::from(FilterType::BasicBch), 1);
        assert_eq!(u8::from(FilterType::Es), 88);
        assert_eq!(FilterType::try_from(88), Ok(FilterType::Es));
        assert!(FilterType::try_from(2).is_err());
    }

    #[test]
    fn test_parameters() {
        assert_eq!(FilterType::Basic.p(), 19);
        assert_eq!(FilterType::Basic.m(), 784_931);
        assert_eq!(FilterType::Es.p(), 23);
        assert_eq!(FilterType::Es.m(), 4_194_304);
        assert!(!FilterType::Basic.includes_outpoints());
        assert!(FilterType::BasicBch.includes_outpoints());
    }
}
