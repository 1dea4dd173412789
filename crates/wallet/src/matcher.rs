//! Exact transaction matching.
//!
//! GCS filters only say a block *may* contain wallet activity; this is
//! the deterministic replay that confirms it, comparing scriptPubKeys
//! and consumed outpoints byte for byte.  The mempool path uses the
//! same comparison with no filter involved.

use std::collections::{BTreeSet, HashMap};

use bitcoin::Transaction;

use cinder_primitives::keys::KeyId;
use cinder_primitives::tx::Outpoint;

/// Confirmed activity found in one transaction.
#[derive(Clone, Debug, Default)]
pub struct TxMatch {
    /// (output index, owning key) for outputs paying one of our
    /// scripts.
    pub outputs: Vec<(u32, KeyId)>,

    /// Wallet outpoints this transaction consumes.
    pub spends: Vec<Outpoint>,
}

impl TxMatch {
    pub fn is_relevant(&self) -> bool {
        !self.outputs.is_empty() || !self.spends.is_empty()
    }
}

/// Tests one transaction against the wallet's script set and tracked
/// outpoints.  `scripts` maps scriptPubKey bytes to the key that owns
/// the script.
pub fn match_transaction(
    tx: &Transaction,
    scripts: &HashMap<Vec<u8>, KeyId>,
    tracked: &BTreeSet<Outpoint>,
) -> TxMatch {
    let mut result = TxMatch::default();

    for (vout, txout) in tx.output.iter().enumerate() {
        if let Some(key) = scripts.get(txout.script_pubkey.as_bytes()) {
            result.outputs.push((vout as u32, *key));
        }
    }

    if !tx.is_coinbase() {
        for input in &tx.input {
            let outpoint: Outpoint = input.previous_output.into();
            if tracked.contains(&outpoint) {
                result.spends.push(outpoint);
            }
        }
    }

    result
}
