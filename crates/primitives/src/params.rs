//! Per-chain consensus parameters the scanning engine needs.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::block::BlockPosition;
use crate::buf::Buf32;
use crate::constants::COINBASE_MATURITY;
use crate::filter::FilterType;

/// The chains this engine knows how to scan.
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
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Chain {
    Bitcoin = 0,
    BitcoinTestnet = 1,
    BitcoinCash = 2,
    BitcoinCashTestnet = 3,
    /// Regtest-style chain used by the test suite.
    UnitTest = 99,
}

impl Chain {
    /// Hash of the chain's genesis block, internal byte order.
    pub fn genesis_hash(&self) -> Buf32 {
        let hex = match self {
            Self::Bitcoin | Self::BitcoinCash => {
                "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
            }
            Self::BitcoinTestnet | Self::BitcoinCashTestnet => {
                "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000"
            }
            Self::UnitTest => "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f",
        };

        hex.parse().expect("params: genesis hash")
    }

    pub fn genesis_position(&self) -> BlockPosition {
        BlockPosition::new(0, self.genesis_hash())
    }

    /// The filter type wallets scan with by default on this chain.
    pub fn default_filter_type(&self) -> FilterType {
        match self {
            Self::Bitcoin | Self::BitcoinTestnet | Self::UnitTest => FilterType::Basic,
            Self::BitcoinCash | Self::BitcoinCashTestnet => FilterType::BasicBch,
        }
    }

    /// Confirmations before a coinbase output becomes spendable.
    pub fn maturity_window(&self) -> i64 {
        COINBASE_MATURITY
    }

    /// Amount below which a change output is folded into the fee.
    pub fn dust_threshold(&self) -> u64 {
        546
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bitcoin => "bitcoin",
            Self::BitcoinTestnet => "bitcoin-testnet",
            Self::BitcoinCash => "bitcoincash",
            Self::BitcoinCashTestnet => "bitcoincash-testnet",
            Self::UnitTest => "unittest",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_positions() {
        for chain in [
            Chain::Bitcoin,
            Chain::BitcoinTestnet,
            Chain::BitcoinCash,
            Chain::UnitTest,
        ] {
            let pos = chain.genesis_position();
            assert_eq!(pos.height(), 0);
            assert!(!pos.hash().is_zero());
        }
        assert_eq!(
            Chain::Bitcoin.genesis_hash(),
            Chain::BitcoinCash.genesis_hash()
        );
    }
}
