//! Record types shared between the storage traits and their consumers.

use std::collections::{BTreeMap, BTreeSet};

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use cinder_primitives::prelude::*;

/// Lifecycle state of one wallet-owned transaction output.
///
/// Transitions are driven only through the output store's transactional
/// API; see the store documentation for the permitted edges.
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
pub enum TxoState {
    /// Created by a mempool transaction, not yet mined.
    UnconfirmedNew,
    /// Created by a mined transaction.
    ConfirmedNew,
    /// Consumed by a mempool transaction.
    UnconfirmedSpend,
    /// Consumed by a mined transaction.
    ConfirmedSpend,
    /// Creation was rolled back by a reorg.
    OrphanedNew,
    /// Spend was rolled back by a reorg.
    OrphanedSpend,
    /// Coinbase output inside the maturity window.
    Immature,
    /// Held for a pending spend proposal.
    Reserved,
}

impl TxoState {
    /// Whether the output contributes to the confirmed balance.
    pub fn is_confirmed_spendable(&self) -> bool {
        matches!(self, Self::ConfirmedNew)
    }

    /// Whether the output contributes to the unconfirmed balance.
    pub fn is_unspent(&self) -> bool {
        matches!(
            self,
            Self::UnconfirmedNew | Self::ConfirmedNew | Self::Immature | Self::Reserved
        )
    }
}

/// Qualifier tags attached to an output in addition to its state.
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
pub enum TxoTag {
    Normal,
    /// Coinbase output, subject to the maturity window.
    Generation,
    /// Output on a notification subchain.
    Notification,
    /// Change we created for our own spend.
    Change,
}

/// One wallet-owned output and everything we track about it.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct OutputRecord {
    pub value: u64,
    pub script: Vec<u8>,
    pub state: TxoState,
    /// Position of the block the creating transaction was mined in;
    /// blank for mempool outputs.
    pub position: BlockPosition,
    pub nym: NymId,
    pub subaccount: SubaccountId,
    pub keys: Vec<KeyId>,
    pub tags: BTreeSet<TxoTag>,
    /// Proposal currently holding this output, if reserved.
    pub proposal: Option<Buf32>,
    /// Contact attribution, when known.
    pub payer: Option<Buf32>,
    pub payee: Option<Buf32>,
}

impl OutputRecord {
    pub fn new(
        value: u64,
        script: Vec<u8>,
        state: TxoState,
        position: BlockPosition,
        nym: NymId,
        subaccount: SubaccountId,
        keys: Vec<KeyId>,
    ) -> Self {
        Self {
            value,
            script,
            state,
            position,
            nym,
            subaccount,
            keys,
            tags: BTreeSet::new(),
            proposal: None,
            payer: None,
            payee: None,
        }
    }
}

/// One pattern the scanner tests filters against.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub index: ChildIndex,
    pub element: Vec<u8>,
}

/// Batch of elements to index, keyed by the BIP-32 child index they were
/// derived from.
pub type ElementMap = BTreeMap<ChildIndex, Vec<Vec<u8>>>;

/// A transaction confirmed in a block together with the output indices
/// that matched wallet patterns.
#[derive(Clone, Debug)]
pub struct MatchedTransaction {
    pub tx: bitcoin::Transaction,
    /// (output index, key that owns it) for every wallet output.
    pub matched_outputs: Vec<(u32, KeyId)>,
}

/// Confirmed matches grouped by the position they were mined at.
pub type BatchedMatches = BTreeMap<BlockPosition, Vec<MatchedTransaction>>;

/// Outputs created/consumed by a store mutation, reported back to the
/// caller for event publication.
pub type TxoSet = Vec<(Outpoint, OutputRecord)>;

/// One requested payment inside a proposal.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ProposalPayment {
    pub script: Vec<u8>,
    pub amount: u64,
    /// Contact the payment is directed at, for attribution.
    pub contact: Option<Buf32>,
}

/// A requested spend, stored until its transaction confirms or the
/// proposal is abandoned.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: Buf32,
    pub spender: NymId,
    /// Subaccount whose internal subchain receives any change.
    pub change_subaccount: SubaccountId,
    pub payments: Vec<ProposalPayment>,
    pub memo: String,
    /// Unix seconds after which the proposal should be abandoned.
    pub expires: u64,
    /// Serialized finished transaction, once built.
    pub finished_tx: Option<Vec<u8>>,
}

/// Constraints applied when reserving a UTXO for spending.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpendPolicy {
    /// Only consider outputs mined at least this many blocks ago.
    pub min_confirmations: i64,
    /// Only consider P2WPKH outputs.
    pub segwit_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspent_states() {
        assert!(TxoState::ConfirmedNew.is_unspent());
        assert!(TxoState::Reserved.is_unspent());
        assert!(!TxoState::ConfirmedSpend.is_unspent());
        assert!(!TxoState::OrphanedNew.is_unspent());
        assert!(TxoState::ConfirmedNew.is_confirmed_spendable());
        assert!(!TxoState::Immature.is_confirmed_spendable());
    }
}
