//! Element extraction for block-derived filters.

use bitcoin::Block;

use cinder_primitives::filter::FilterType;
use cinder_primitives::tx::Outpoint;

/// The element set a block commits to under the given filter type:
/// every non-empty, non-datacarrier output script, plus the consumed
/// outpoints for the outpoint-carrying filter types.
pub fn filter_elements(block: &Block, filter_type: FilterType) -> Vec<Vec<u8>> {
    let mut out = Vec::new();

    for tx in &block.txdata {
        for txout in &tx.output {
            let script = &txout.script_pubkey;
            if script.is_empty() || script.is_op_return() {
                continue;
            }
            out.push(script.to_bytes());
        }

        if filter_type.includes_outpoints() && !tx.is_coinbase() {
            for input in &tx.input {
                let outpoint: Outpoint = input.previous_output.into();
                out.push(outpoint.serialize().to_vec());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    };

    use super::*;

    fn block_with(txs: Vec<Transaction>) -> Block {
        Block {
            header: bitcoin::block::Header {
                version: bitcoin::block::Version::TWO,
                prev_blockhash: bitcoin::BlockHash::all_zeros(),
                merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                time: 0,
                bits: bitcoin::CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: txs,
        }
    }

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|script_pubkey| TxOut {
                    value: Amount::from_sat(1000),
                    script_pubkey,
                })
                .collect(),
        }
    }

    #[test]
    fn test_outpoints_only_for_carrying_types() {
        let spend = OutPoint {
            txid: Txid::from_byte_array([7; 32]),
            vout: 1,
        };
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let block = block_with(vec![tx(vec![spend], vec![script.clone()])]);

        let basic = filter_elements(&block, FilterType::Basic);
        assert_eq!(basic, vec![script.to_bytes()]);

        let bch = filter_elements(&block, FilterType::BasicBch);
        assert_eq!(bch.len(), 2);
        assert!(bch.contains(&script.to_bytes()));

        let mut wire = [7u8; 36];
        wire[32..].copy_from_slice(&1u32.to_le_bytes());
        assert!(bch.contains(&wire.to_vec()));
    }

    #[test]
    fn test_op_return_and_empty_scripts_skipped() {
        let outputs = vec![
            ScriptBuf::new(),
            ScriptBuf::new_op_return([1, 2, 3]),
            ScriptBuf::from_bytes(vec![0x51]),
        ];
        let block = block_with(vec![tx(vec![], outputs)]);
        let elements = filter_elements(&block, FilterType::Basic);
        assert_eq!(elements, vec![vec![0x51]]);
    }
}
