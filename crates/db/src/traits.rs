//! Storage interface traits for the wallet database and the filter
//! chain.  This borrows some of its naming conventions from reth.

use std::collections::BTreeSet;

use cinder_gcs::Gcs;
use cinder_primitives::prelude::*;

use crate::errors::DbResult;
use crate::types::*;

/// Subchain-scoped scanning state: pattern sets, indexing progress, and
/// scan progress.
pub trait SubchainStore {
    /// Idempotently allocates the index row for a subchain.
    fn get_or_create_subchain(
        &self,
        subaccount: &SubaccountId,
        kind: SubchainKind,
        filter_type: FilterType,
    ) -> DbResult<SubchainIndex>;

    /// Atomically writes a batch of derived elements and bumps
    /// `last_indexed` to the highest child index in the batch.
    fn add_elements(&self, subchain: &SubchainIndex, elements: &ElementMap) -> DbResult<()>;

    /// All patterns indexed for the subchain.
    fn patterns(&self, subchain: &SubchainIndex) -> DbResult<Vec<Pattern>>;

    /// Patterns not yet confirmed-tested against the given block.
    fn untested_patterns(
        &self,
        subchain: &SubchainIndex,
        block: &Buf32,
    ) -> DbResult<Vec<Pattern>>;

    /// Records that the given patterns were exactly matched against a
    /// block's transactions.
    fn add_tested(
        &self,
        subchain: &SubchainIndex,
        block: &Buf32,
        patterns: &BTreeSet<PatternId>,
    ) -> DbResult<()>;

    fn last_indexed(&self, subchain: &SubchainIndex) -> DbResult<Option<ChildIndex>>;

    fn last_scanned(&self, subchain: &SubchainIndex) -> DbResult<BlockPosition>;

    /// Persists scan progress.  Monotone except during reorg handling.
    fn set_last_scanned(&self, subchain: &SubchainIndex, position: BlockPosition) -> DbResult<()>;

    /// Rewinds scan progress below a reorg'd height.  `resolve` maps a
    /// height to the best-chain position at that height.  Returns
    /// whether anything changed.
    fn subchain_reorg(
        &self,
        subchain: &SubchainIndex,
        last_good: Height,
        resolve: &dyn Fn(Height) -> Option<BlockPosition>,
    ) -> DbResult<bool>;
}

/// The wallet's UTXO set, indexed every way the queries need.
pub trait OutputStore {
    /// Records a batch of confirmed transactions, upserting matched
    /// outputs as `ConfirmedNew` (or `Immature` for generation outputs)
    /// and transitioning consumed outpoints to `ConfirmedSpend`.
    /// The whole batch commits atomically.  Created and consumed
    /// outputs are appended to the out-parameters.
    fn add_confirmed_transactions(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        subchain: &SubchainIndex,
        matches: &BatchedMatches,
        created: &mut TxoSet,
        consumed: &mut TxoSet,
    ) -> DbResult<()>;

    /// As confirmed, but for mempool transactions; new outputs are
    /// `UnconfirmedNew`, consumed ones `UnconfirmedSpend`, and the mined
    /// position stays blank.
    fn add_mempool_transaction(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        tx: &MatchedTransaction,
        created: &mut TxoSet,
    ) -> DbResult<()>;

    /// Records our own outgoing transaction for a proposal: reserved
    /// inputs become `UnconfirmedSpend`, new outputs `UnconfirmedNew`.
    fn add_outgoing_transaction(
        &self,
        proposal: &Buf32,
        record: &ProposalRecord,
        tx: &bitcoin::Transaction,
        change_keys: &[(u32, KeyId)],
    ) -> DbResult<()>;

    /// Selects one `ConfirmedNew` output satisfying the policy, flips it
    /// to `Reserved` and tags it with the proposal.  Returns `None` when
    /// nothing qualifies.
    fn reserve_utxo(
        &self,
        spender: &NymId,
        proposal: &Buf32,
        policy: &SpendPolicy,
    ) -> DbResult<Option<(Outpoint, OutputRecord)>>;

    /// Returns every output reserved by the proposal to `ConfirmedNew`.
    fn release_proposal(&self, proposal: &Buf32) -> DbResult<()>;

    /// Matures `Immature` outputs whose height is buried behind the
    /// maturity window below `position`.
    fn advance_to(&self, position: &BlockPosition) -> DbResult<()>;

    /// Rolls back outputs mined above the common ancestor:
    /// `ConfirmedNew -> OrphanedNew`, `ConfirmedSpend -> OrphanedSpend`.
    /// Idempotent.
    fn reorg_to(&self, ancestor: &BlockPosition, reorged: &[BlockPosition]) -> DbResult<()>;

    /// Best position the store has processed through.
    fn position(&self) -> DbResult<BlockPosition>;

    fn balance(&self) -> DbResult<Balance>;

    fn balance_for_nym(&self, nym: &NymId) -> DbResult<Balance>;

    fn balance_for_account(&self, nym: &NymId, subaccount: &SubaccountId) -> DbResult<Balance>;

    fn balance_for_key(&self, key: &KeyId) -> DbResult<Balance>;

    /// Outputs in a given state, or every output when `None`.
    fn outputs(&self, state: Option<TxoState>) -> DbResult<TxoSet>;

    fn outputs_for_nym(&self, nym: &NymId, state: Option<TxoState>) -> DbResult<TxoSet>;

    fn output(&self, outpoint: &Outpoint) -> DbResult<Option<OutputRecord>>;

    /// Txids of transactions that created or consumed wallet outputs.
    fn transactions(&self) -> DbResult<Vec<Buf32>>;

    /// Contacts associated with a script pattern hash.
    fn lookup_contact(&self, pattern_hash: &Buf32) -> DbResult<BTreeSet<Buf32>>;
}

/// Pending spend proposals.
pub trait ProposalStore {
    fn add_proposal(&self, record: &ProposalRecord) -> DbResult<()>;

    fn load_proposal(&self, id: &Buf32) -> DbResult<Option<ProposalRecord>>;

    fn load_proposals(&self) -> DbResult<Vec<ProposalRecord>>;

    /// Proposals whose finished transaction has confirmed.
    fn completed_proposals(&self) -> DbResult<BTreeSet<Buf32>>;

    /// Drops proposal records, typically after their transactions
    /// confirmed.  Reservation release is the output store's concern.
    fn forget_proposals(&self, ids: &BTreeSet<Buf32>) -> DbResult<()>;

    /// Marks a proposal's transaction as confirmed.
    fn confirm_proposal(&self, id: &Buf32) -> DbResult<()>;
}

/// Persisted cfilter chain state for one chain.
pub trait FilterStore {
    /// Stores a batch of filter headers keyed by block hash.
    fn store_headers(
        &self,
        filter_type: FilterType,
        headers: &[(Buf32, Buf32)],
    ) -> DbResult<()>;

    fn load_header(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Buf32>>;

    /// Stores a batch of filters keyed by block hash.
    fn store_filters(&self, filter_type: FilterType, filters: &[(Buf32, Gcs)]) -> DbResult<()>;

    fn load_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Gcs>>;

    fn have_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<bool>;

    fn header_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>>;

    fn set_header_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()>;

    fn filter_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>>;

    fn set_filter_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()>;
}

/// Everything the wallet needs from one database instance.
pub trait WalletDatabase:
    SubchainStore + OutputStore + ProposalStore + Send + Sync + 'static
{
}

impl<T: SubchainStore + OutputStore + ProposalStore + Send + Sync + 'static> WalletDatabase for T {}
