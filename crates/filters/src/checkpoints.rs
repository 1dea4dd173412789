//! Well-known cfheader checkpoints.
//!
//! Values are stored in internal byte order, matching what the header
//! computation produces directly.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use cinder_primitives::buf::Buf32;
use cinder_primitives::filter::FilterType;
use cinder_primitives::params::Chain;

/// `height -> filter type -> expected cfheader`.
pub type CheckpointMap = BTreeMap<i64, Vec<(FilterType, Buf32)>>;

fn parse(hex: &str) -> Buf32 {
    hex.parse().expect("checkpoints: header hex")
}

fn build() -> BTreeMap<Chain, CheckpointMap> {
    let mut out = BTreeMap::new();

    let mut bitcoin = CheckpointMap::new();
    bitcoin.insert(
        0,
        vec![
            (
                FilterType::Basic,
                parse("9f3c30f0c37fb977cf3e1a3173c631e8ff119ad3088b6f5b2bced0802139c202"),
            ),
            (
                FilterType::Es,
                parse("fad52acc389a391c1d6d94e8984fe77323fbda24fb31299b88635d7bee0278e8"),
            ),
        ],
    );
    out.insert(Chain::Bitcoin, bitcoin.clone());
    out.insert(Chain::BitcoinCash, bitcoin);

    let mut testnet = CheckpointMap::new();
    testnet.insert(
        0,
        vec![
            (
                FilterType::Basic,
                parse("50b781aed7b7129012a6d20e2d040027937f3affaee573779908ebb779455821"),
            ),
            (
                FilterType::BasicBch,
                parse("50b781aed7b7129012a6d20e2d040027937f3affaee573779908ebb779455821"),
            ),
            (
                FilterType::Es,
                parse("995cfe5d055c9158c5a388b71fb2ddbe292c9ca2d30dca91359d8cbbe4603e02"),
            ),
        ],
    );
    out.insert(Chain::BitcoinTestnet, testnet.clone());
    out.insert(Chain::BitcoinCashTestnet, testnet);

    let mut unit_test = CheckpointMap::new();
    unit_test.insert(
        0,
        vec![
            (
                FilterType::Basic,
                parse("2b5adc66021d5c775f630efd91518cf6ce3e9f525bbf54d9f0d709451e305e48"),
            ),
            (
                FilterType::BasicBch,
                parse("2b5adc66021d5c775f630efd91518cf6ce3e9f525bbf54d9f0d709451e305e48"),
            ),
            (
                FilterType::Es,
                parse("5e0aa302450f931bc2e4fab27632231a06964277ea8dfcdd93c19149a24fe788"),
            ),
        ],
    );
    out.insert(Chain::UnitTest, unit_test);

    out
}

/// The consensus checkpoint table for a chain.
pub fn filter_checkpoints(chain: Chain) -> &'static CheckpointMap {
    static TABLE: OnceLock<BTreeMap<Chain, CheckpointMap>> = OnceLock::new();
    static EMPTY: OnceLock<CheckpointMap> = OnceLock::new();

    TABLE
        .get_or_init(build)
        .get(&chain)
        .unwrap_or_else(|| EMPTY.get_or_init(CheckpointMap::new))
}

/// Expected header at a checkpoint height, if one is defined.
pub fn checkpoint_header(
    checkpoints: &CheckpointMap,
    height: i64,
    filter_type: FilterType,
) -> Option<Buf32> {
    checkpoints
        .get(&height)?
        .iter()
        .find(|(ft, _)| *ft == filter_type)
        .map(|(_, header)| *header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_chain_has_a_genesis_checkpoint() {
        for chain in [
            Chain::Bitcoin,
            Chain::BitcoinTestnet,
            Chain::BitcoinCash,
            Chain::BitcoinCashTestnet,
            Chain::UnitTest,
        ] {
            let map = filter_checkpoints(chain);
            let genesis = map.get(&0).expect("genesis row");
            assert!(!genesis.is_empty());
        }
    }

    #[test]
    fn test_lookup_by_type() {
        let map = filter_checkpoints(Chain::Bitcoin);
        assert!(checkpoint_header(map, 0, FilterType::Basic).is_some());
        assert!(checkpoint_header(map, 0, FilterType::Es).is_some());
        assert!(checkpoint_header(map, 0, FilterType::BasicBch).is_none());
        assert!(checkpoint_header(map, 1, FilterType::Basic).is_none());
    }

    #[test]
    fn test_mainnet_and_bch_share_genesis_basic_header() {
        let btc = checkpoint_header(filter_checkpoints(Chain::Bitcoin), 0, FilterType::Basic);
        let bch = checkpoint_header(filter_checkpoints(Chain::BitcoinCash), 0, FilterType::Basic);
        assert_eq!(btc, bch);
    }
}
