//! rocksdb-backed implementation of the wallet storage traits.
//!
//! One rocksdb instance holds every table; sub-stores share it and
//! serialize their writers independently.  All multi-row mutations go
//! through [`rockbound::SchemaBatch`] so they land atomically.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rockbound::DB;
use rocksdb_options::get_db_opts;

use cinder_db::errors::DbError;
use cinder_db::traits::*;
use cinder_db::types::*;
use cinder_db::DbResult;
use cinder_gcs::Gcs;
use cinder_primitives::prelude::*;

mod cache;
mod filters;
mod output;
mod proposal;
mod schemas;
mod subchain;
#[cfg(feature = "test_utils")]
pub mod test_utils;

pub use filters::FilterDb;
pub use output::OutputDb;
pub use proposal::ProposalDb;
pub use subchain::SubchainDb;

const DB_NAME: &str = "wallet_db";

mod rocksdb_options {
    use rockbound::rocksdb::Options;

    pub(crate) fn get_db_opts() -> Options {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        db_opts
    }
}

/// Opens (creating if missing) the store's rocksdb instance.
pub fn open_rocksdb(path: &Path) -> anyhow::Result<Arc<DB>> {
    let db_opts = get_db_opts();
    let db = DB::open(
        path,
        DB_NAME,
        schemas::STORE_COLUMN_FAMILIES.to_vec(),
        &db_opts,
    )?;
    Ok(Arc::new(db))
}

pub(crate) fn backend_err(e: impl std::fmt::Display) -> DbError {
    DbError::Backend(e.to_string())
}

pub(crate) fn codec_err(e: impl std::fmt::Display) -> DbError {
    DbError::Codec(e.to_string())
}

/// All wallet sub-stores over one shared rocksdb instance.
pub struct WalletDb {
    subchains: SubchainDb,
    outputs: OutputDb,
    proposals: ProposalDb,
    filters: FilterDb,
}

impl WalletDb {
    pub fn new(db: Arc<DB>, chain: Chain) -> Self {
        Self {
            subchains: SubchainDb::new(db.clone(), chain),
            outputs: OutputDb::new(db.clone(), chain),
            proposals: ProposalDb::new(db.clone()),
            filters: FilterDb::new(db),
        }
    }

    pub fn open(path: &Path, chain: Chain) -> anyhow::Result<Self> {
        Ok(Self::new(open_rocksdb(path)?, chain))
    }

    /// Drops every in-memory cache so reads rebuild from disk.
    pub fn flush_caches(&self) {
        self.subchains.flush_caches();
        self.outputs.flush_caches();
    }
}

impl SubchainStore for WalletDb {
    fn get_or_create_subchain(
        &self,
        subaccount: &SubaccountId,
        kind: SubchainKind,
        filter_type: FilterType,
    ) -> DbResult<SubchainIndex> {
        self.subchains
            .get_or_create_subchain(subaccount, kind, filter_type)
    }

    fn add_elements(&self, subchain: &SubchainIndex, elements: &ElementMap) -> DbResult<()> {
        self.subchains.add_elements(subchain, elements)
    }

    fn patterns(&self, subchain: &SubchainIndex) -> DbResult<Vec<Pattern>> {
        self.subchains.patterns(subchain)
    }

    fn untested_patterns(&self, subchain: &SubchainIndex, block: &Buf32) -> DbResult<Vec<Pattern>> {
        self.subchains.untested_patterns(subchain, block)
    }

    fn add_tested(
        &self,
        subchain: &SubchainIndex,
        block: &Buf32,
        patterns: &BTreeSet<PatternId>,
    ) -> DbResult<()> {
        self.subchains.add_tested(subchain, block, patterns)
    }

    fn last_indexed(&self, subchain: &SubchainIndex) -> DbResult<Option<ChildIndex>> {
        self.subchains.last_indexed(subchain)
    }

    fn last_scanned(&self, subchain: &SubchainIndex) -> DbResult<BlockPosition> {
        self.subchains.last_scanned(subchain)
    }

    fn set_last_scanned(&self, subchain: &SubchainIndex, position: BlockPosition) -> DbResult<()> {
        self.subchains.set_last_scanned(subchain, position)
    }

    fn subchain_reorg(
        &self,
        subchain: &SubchainIndex,
        last_good: Height,
        resolve: &dyn Fn(Height) -> Option<BlockPosition>,
    ) -> DbResult<bool> {
        self.subchains.subchain_reorg(subchain, last_good, resolve)
    }
}

impl OutputStore for WalletDb {
    fn add_confirmed_transactions(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        subchain: &SubchainIndex,
        matches: &BatchedMatches,
        created: &mut TxoSet,
        consumed: &mut TxoSet,
    ) -> DbResult<()> {
        self.outputs
            .add_confirmed_transactions(nym, subaccount, subchain, matches, created, consumed)
    }

    fn add_mempool_transaction(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        tx: &MatchedTransaction,
        created: &mut TxoSet,
    ) -> DbResult<()> {
        self.outputs
            .add_mempool_transaction(nym, subaccount, tx, created)
    }

    fn add_outgoing_transaction(
        &self,
        proposal: &Buf32,
        record: &ProposalRecord,
        tx: &bitcoin::Transaction,
        change_keys: &[(u32, KeyId)],
    ) -> DbResult<()> {
        self.outputs
            .add_outgoing_transaction(proposal, record, tx, change_keys)
    }

    fn reserve_utxo(
        &self,
        spender: &NymId,
        proposal: &Buf32,
        policy: &SpendPolicy,
    ) -> DbResult<Option<(Outpoint, OutputRecord)>> {
        self.outputs.reserve_utxo(spender, proposal, policy)
    }

    fn release_proposal(&self, proposal: &Buf32) -> DbResult<()> {
        self.outputs.release_proposal(proposal)
    }

    fn advance_to(&self, position: &BlockPosition) -> DbResult<()> {
        self.outputs.advance_to(position)
    }

    fn reorg_to(&self, ancestor: &BlockPosition, reorged: &[BlockPosition]) -> DbResult<()> {
        self.outputs.reorg_to(ancestor, reorged)
    }

    fn position(&self) -> DbResult<BlockPosition> {
        self.outputs.position()
    }

    fn balance(&self) -> DbResult<Balance> {
        self.outputs.balance()
    }

    fn balance_for_nym(&self, nym: &NymId) -> DbResult<Balance> {
        self.outputs.balance_for_nym(nym)
    }

    fn balance_for_account(&self, nym: &NymId, subaccount: &SubaccountId) -> DbResult<Balance> {
        self.outputs.balance_for_account(nym, subaccount)
    }

    fn balance_for_key(&self, key: &KeyId) -> DbResult<Balance> {
        self.outputs.balance_for_key(key)
    }

    fn outputs(&self, state: Option<TxoState>) -> DbResult<TxoSet> {
        self.outputs.outputs(state)
    }

    fn outputs_for_nym(&self, nym: &NymId, state: Option<TxoState>) -> DbResult<TxoSet> {
        self.outputs.outputs_for_nym(nym, state)
    }

    fn output(&self, outpoint: &Outpoint) -> DbResult<Option<OutputRecord>> {
        self.outputs.output(outpoint)
    }

    fn transactions(&self) -> DbResult<Vec<Buf32>> {
        self.outputs.transactions()
    }

    fn lookup_contact(&self, pattern_hash: &Buf32) -> DbResult<BTreeSet<Buf32>> {
        self.outputs.lookup_contact(pattern_hash)
    }
}

impl ProposalStore for WalletDb {
    fn add_proposal(&self, record: &ProposalRecord) -> DbResult<()> {
        self.proposals.add_proposal(record)
    }

    fn load_proposal(&self, id: &Buf32) -> DbResult<Option<ProposalRecord>> {
        self.proposals.load_proposal(id)
    }

    fn load_proposals(&self) -> DbResult<Vec<ProposalRecord>> {
        self.proposals.load_proposals()
    }

    fn completed_proposals(&self) -> DbResult<BTreeSet<Buf32>> {
        self.proposals.completed_proposals()
    }

    fn forget_proposals(&self, ids: &BTreeSet<Buf32>) -> DbResult<()> {
        self.proposals.forget_proposals(ids)
    }

    fn confirm_proposal(&self, id: &Buf32) -> DbResult<()> {
        self.proposals.confirm_proposal(id)
    }
}

impl FilterStore for WalletDb {
    fn store_headers(&self, filter_type: FilterType, headers: &[(Buf32, Buf32)]) -> DbResult<()> {
        self.filters.store_headers(filter_type, headers)
    }

    fn load_header(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Buf32>> {
        self.filters.load_header(filter_type, block)
    }

    fn store_filters(&self, filter_type: FilterType, filters: &[(Buf32, Gcs)]) -> DbResult<()> {
        self.filters.store_filters(filter_type, filters)
    }

    fn load_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<Option<Gcs>> {
        self.filters.load_filter(filter_type, block)
    }

    fn have_filter(&self, filter_type: FilterType, block: &Buf32) -> DbResult<bool> {
        self.filters.have_filter(filter_type, block)
    }

    fn header_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>> {
        self.filters.header_tip(filter_type)
    }

    fn set_header_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()> {
        self.filters.set_header_tip(filter_type, position)
    }

    fn filter_tip(&self, filter_type: FilterType) -> DbResult<Option<BlockPosition>> {
        self.filters.filter_tip(filter_type)
    }

    fn set_filter_tip(&self, filter_type: FilterType, position: &BlockPosition) -> DbResult<()> {
        self.filters.set_filter_tip(filter_type, position)
    }
}
