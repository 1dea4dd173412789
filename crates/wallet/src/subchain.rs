//! Per-(subaccount, subchain) scanning state machine.
//!
//! Each instance owns the five-stage cycle: index keys into filter
//! patterns, GCS-test filters, process candidate blocks, rescan after
//! late pattern growth, and report progress.  Reorg handling rewinds
//! the database through the same instance.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_db::types::{BatchedMatches, ElementMap, MatchedTransaction, TxoSet};
use cinder_filters::{BlockOracle, FilterOracle, HeaderOracle};
use cinder_gcs::Gcs;
use cinder_primitives::constants::{
    DEFAULT_MAX_SCAN, DEFAULT_SCAN_THRESHOLD, POST_MATCH_REWIND,
};
use cinder_primitives::prelude::*;
use cinder_status::{StatusPublisher, WalletEvent};

use crate::errors::{WalletError, WalletResult};
use crate::keys::{key_filter_elements, key_scripts, KeySource};
use crate::matcher::match_transaction;

/// Narrow view of the filter oracle the scanner needs.
pub trait FilterSource: Send + Sync + 'static {
    fn filter_tip(&self) -> BlockPosition;

    fn load_filter(&self, block: &Buf32) -> Option<Gcs>;
}

impl<S, H> FilterSource for FilterOracle<S, H>
where
    S: cinder_db::traits::FilterStore + Send + Sync + 'static,
    H: HeaderOracle,
{
    fn filter_tip(&self) -> BlockPosition {
        FilterOracle::filter_tip(self)
    }

    fn load_filter(&self, block: &Buf32) -> Option<Gcs> {
        FilterOracle::load_filter(self, block)
    }
}

/// Scanner lifecycle, driven by the owning account.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubchainState {
    Normal,
    PreReorg,
    Reorg,
    PostReorg,
    PreShutdown,
    Shutdown,
}

impl SubchainState {
    fn can_become(&self, to: SubchainState) -> bool {
        use SubchainState::*;
        matches!(
            (self, to),
            (Normal, PreReorg)
                | (PreReorg, Reorg)
                | (Reorg, PostReorg)
                | (PostReorg, Normal)
                | (Normal, PreShutdown)
                | (PostReorg, PreShutdown)
                | (PreShutdown, Shutdown)
        )
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ScannerConfig {
    /// Filters tested per scan tick.
    pub max_scan: usize,

    /// Distance below the rescan boundary treated as caught up.  The
    /// rescan boundary itself is `scan_threshold + max_scan`.
    pub scan_threshold: i64,

    /// How far below a confirmed match the scanner rewinds to
    /// re-verify.
    pub post_match_rewind: i64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_scan: DEFAULT_MAX_SCAN,
            scan_threshold: DEFAULT_SCAN_THRESHOLD,
            post_match_rewind: POST_MATCH_REWIND,
        }
    }
}

pub struct SubchainStateData<D, K> {
    nym: NymId,
    subaccount: SubaccountId,
    kind: SubchainKind,
    chain: Chain,
    filter_type: FilterType,
    /// Database key for every subchain-scoped table.
    index: SubchainIndex,
    db: Arc<D>,
    keys: Arc<K>,
    filters: Arc<dyn FilterSource>,
    blocks: Arc<dyn BlockOracle>,
    headers: Arc<dyn HeaderOracle>,
    status: Arc<StatusPublisher>,
    config: ScannerConfig,
    state: Mutex<SubchainState>,
    process_queue: Mutex<VecDeque<BlockPosition>>,
    /// Set when patterns grew below the scanned tip, cleared by the
    /// rescan stage.
    scan_dirty: AtomicBool,
}

impl<D: WalletDatabase, K: KeySource> SubchainStateData<D, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nym: NymId,
        subaccount: SubaccountId,
        kind: SubchainKind,
        chain: Chain,
        db: Arc<D>,
        keys: Arc<K>,
        filters: Arc<dyn FilterSource>,
        blocks: Arc<dyn BlockOracle>,
        headers: Arc<dyn HeaderOracle>,
        status: Arc<StatusPublisher>,
        config: ScannerConfig,
    ) -> WalletResult<Self> {
        let filter_type = chain.default_filter_type();
        let index = db.get_or_create_subchain(&subaccount, kind, filter_type)?;

        Ok(Self {
            nym,
            subaccount,
            kind,
            chain,
            filter_type,
            index,
            db,
            keys,
            filters,
            blocks,
            headers,
            status,
            config,
            state: Mutex::new(SubchainState::Normal),
            process_queue: Mutex::new(VecDeque::new()),
            scan_dirty: AtomicBool::new(false),
        })
    }

    pub fn subchain_index(&self) -> &SubchainIndex {
        &self.index
    }

    pub fn kind(&self) -> SubchainKind {
        self.kind
    }

    pub fn state(&self) -> SubchainState {
        *self.state.lock()
    }

    pub fn change_state(&self, to: SubchainState) -> bool {
        let mut state = self.state.lock();
        if *state == to {
            return true;
        }
        if !state.can_become(to) {
            warn!(from = ?*state, ?to, "rejected subchain state change");
            return false;
        }
        trace!(from = ?*state, ?to, subchain = ?self.kind, "subchain state change");
        *state = to;
        true
    }

    /// One pass of the normal-state cycle.  Returns whether any stage
    /// made progress.
    pub fn tick(&self) -> WalletResult<bool> {
        if self.state() != SubchainState::Normal {
            return Ok(false);
        }

        let mut advanced = self.index_keys()?;
        advanced |= self.rescan()?;
        advanced |= self.scan()?;
        advanced |= self.process_pending()?;
        Ok(advanced)
    }

    /// Stage one: derive filter patterns for any keys the keystore has
    /// that we have not indexed yet.
    pub fn index_keys(&self) -> WalletResult<bool> {
        let Some(latest) = self.keys.last_derived(&self.subaccount, self.kind) else {
            return Ok(false);
        };
        let next = match self.db.last_indexed(&self.index)? {
            Some(last) if last >= latest => return Ok(false),
            Some(last) => last + 1,
            None => 0,
        };

        let mut elements = ElementMap::new();
        for child in next..=latest {
            let key = KeyId::new(self.subaccount, self.kind, child);
            let pubkey = self.keys.pubkey(&key).ok_or(WalletError::UnknownKey(key))?;
            elements.insert(child, key_filter_elements(&pubkey, self.filter_type));
        }

        debug!(
            subchain = ?self.kind,
            from = next,
            to = latest,
            "indexing key patterns"
        );
        self.db.add_elements(&self.index, &elements)?;

        // Patterns that land below the scanned tip need the scanned
        // range re-tested.
        if self.db.last_scanned(&self.index)?.height() >= 0 {
            self.scan_dirty.store(true, Ordering::SeqCst);
        }

        Ok(true)
    }

    /// Stage two: GCS-test filters from the scan tip towards the
    /// oracle's filter tip, queueing candidate blocks.
    pub fn scan(&self) -> WalletResult<bool> {
        let best = self.filters.filter_tip();
        if best.is_blank() {
            return Ok(false);
        }

        let last = self.db.last_scanned(&self.index)?;
        let start = last.height() + 1;
        let stop = best.height().min(start + self.config.max_scan as i64 - 1);
        if start > stop {
            return Ok(false);
        }

        let targets = self.probe_targets(None)?;
        let mut highest = last;
        let mut queued = 0usize;

        for height in start..=stop {
            let Some(position) = self.headers.position_at(height) else {
                break;
            };
            // A missing filter ends the tick; a later one retries.
            let Some(filter) = self.filters.load_filter(position.hash()) else {
                break;
            };

            if !targets.is_empty() && filter.match_any(&targets)? {
                let untested = self.probe_targets(Some(position.hash()))?;
                if !untested.is_empty() && filter.match_any(&untested)? {
                    self.process_queue.lock().push_back(position);
                    queued += 1;
                }
            }

            highest = position;
        }

        if highest == last {
            return Ok(false);
        }

        trace!(subchain = ?self.kind, %highest, queued, "scan advanced");
        self.db.set_last_scanned(&self.index, highest)?;
        self.report_progress(highest);
        Ok(true)
    }

    /// Stage three: fetch queued candidate blocks and confirm matches
    /// exactly.
    pub fn process_pending(&self) -> WalletResult<bool> {
        let mut advanced = false;
        loop {
            let Some(position) = self.process_queue.lock().pop_front() else {
                break;
            };
            self.process_block(&position)?;
            advanced = true;
        }
        Ok(advanced)
    }

    /// Stage four: after patterns grew below the scanned tip, rewind
    /// the scan window so the new patterns get tested.
    pub fn rescan(&self) -> WalletResult<bool> {
        if !self.scan_dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let last = self.db.last_scanned(&self.index)?;
        if last.height() < 0 {
            return Ok(false);
        }

        let boundary = self.config.scan_threshold + self.config.max_scan as i64;
        let target = (last.height() - boundary).max(0);
        let Some(position) = self.headers.position_at(target) else {
            return Ok(false);
        };

        debug!(subchain = ?self.kind, from = %last, to = %position, "rescanning");
        self.db.set_last_scanned(&self.index, position)?;
        Ok(true)
    }

    /// Confirms a candidate block: exact-matches every transaction,
    /// records results, and rewinds the scan window below any hit so
    /// the trailing range is re-verified.
    pub fn process_block(&self, position: &BlockPosition) -> WalletResult<bool> {
        let block = self.blocks.load_block(position.hash()).get()?;
        let block_hash: Buf32 = block.block_hash().into();
        if block_hash != *position.hash() {
            return Err(WalletError::BlockIdMismatch(*position));
        }

        let scripts = self.script_map()?;
        let tracked = self.tracked_outpoints()?;

        let mut matches = Vec::new();
        let mut tested = BTreeSet::new();
        for tx in &block.txdata {
            let hit = match_transaction(tx, &scripts, &tracked);
            if !hit.is_relevant() {
                continue;
            }
            for (_, key) in &hit.outputs {
                tested.insert(PatternId::derive(&self.index, key.index));
            }
            matches.push(MatchedTransaction {
                tx: tx.clone(),
                matched_outputs: hit.outputs,
            });
        }

        self.db.add_tested(&self.index, position.hash(), &tested)?;

        if matches.is_empty() {
            return Ok(false);
        }

        let mut batched = BatchedMatches::new();
        batched.insert(*position, matches);

        let mut created = TxoSet::new();
        let mut consumed = TxoSet::new();
        self.db.add_confirmed_transactions(
            &self.nym,
            &self.subaccount,
            &self.index,
            &batched,
            &mut created,
            &mut consumed,
        )?;

        info!(
            subchain = ?self.kind,
            %position,
            created = created.len(),
            consumed = consumed.len(),
            "confirmed wallet transactions"
        );

        let mut txids = BTreeSet::new();
        for (outpoint, _) in created.iter().chain(consumed.iter()) {
            txids.insert(*outpoint.txid());
        }
        for txid in txids {
            self.status.publish(WalletEvent::NewTransaction {
                nym: self.nym,
                txid,
                chain: self.chain,
            });
        }
        self.publish_balance()?;

        // Re-verify the trailing window below the hit.
        let target = (position.height() - self.config.post_match_rewind).max(0);
        let last = self.db.last_scanned(&self.index)?;
        if last.height() > target {
            if let Some(rewind) = self.headers.position_at(target) {
                self.db.set_last_scanned(&self.index, rewind)?;
            }
        }

        Ok(true)
    }

    /// Tests a mempool transaction with the exact matcher; no filters
    /// involved.
    pub fn process_mempool_tx(&self, tx: &bitcoin::Transaction) -> WalletResult<bool> {
        let scripts = self.script_map()?;
        let tracked = self.tracked_outpoints()?;
        let hit = match_transaction(tx, &scripts, &tracked);
        if !hit.is_relevant() {
            return Ok(false);
        }

        let matched = MatchedTransaction {
            tx: tx.clone(),
            matched_outputs: hit.outputs,
        };
        let mut created = TxoSet::new();
        self.db
            .add_mempool_transaction(&self.nym, &self.subaccount, &matched, &mut created)?;

        self.status.publish(WalletEvent::NewTransaction {
            nym: self.nym,
            txid: tx.compute_txid().into(),
            chain: self.chain,
        });
        self.publish_balance()?;
        Ok(true)
    }

    /// Reorg stage: rolls the database back to the common ancestor.
    /// The shared error counter aborts the fan-out on the first
    /// failure.
    pub fn process_reorg(&self, ancestor: &BlockPosition, errors: &AtomicI32) {
        if errors.load(Ordering::SeqCst) > 0 {
            return;
        }

        let result = (|| -> WalletResult<()> {
            self.db.reorg_to(ancestor, &[])?;
            let resolve = |height: Height| self.headers.position_at(height);
            self.db
                .subchain_reorg(&self.index, ancestor.height(), &resolve)?;
            self.process_queue
                .lock()
                .retain(|p| p.height() <= ancestor.height());
            Ok(())
        })();

        if let Err(err) = result {
            error!(subchain = ?self.kind, %err, "reorg rollback failed");
            errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drains in-flight work ahead of a reorg or shutdown.
    pub fn drain(&self) {
        self.process_queue.lock().clear();
    }

    fn report_progress(&self, position: BlockPosition) {
        self.status.publish(WalletEvent::ScanProgress {
            subchain: self.index,
            position,
        });
    }

    fn publish_balance(&self) -> WalletResult<()> {
        let balance = self.db.balance_for_nym(&self.nym)?;
        self.status.publish(WalletEvent::BalanceChanged {
            nym: self.nym,
            subaccount: Some(self.subaccount),
            balance,
        });
        Ok(())
    }

    /// Element set to probe a filter with: indexed patterns plus the
    /// wire forms of tracked outpoints for the outpoint-carrying filter
    /// types.  With a block hash, only patterns not yet tested against
    /// that block are included.
    fn probe_targets(&self, untested_for: Option<&Buf32>) -> WalletResult<Vec<Vec<u8>>> {
        let patterns = match untested_for {
            Some(block) => self.db.untested_patterns(&self.index, block)?,
            None => self.db.patterns(&self.index)?,
        };

        let mut targets: Vec<Vec<u8>> = patterns.into_iter().map(|p| p.element).collect();

        if self.filter_type.includes_outpoints() {
            for outpoint in self.tracked_outpoints()? {
                targets.push(outpoint.serialize().to_vec());
            }
        }

        Ok(targets)
    }

    /// ScriptPubKeys for every indexed key, for exact confirmation.
    fn script_map(&self) -> WalletResult<HashMap<Vec<u8>, KeyId>> {
        let mut out = HashMap::new();
        let Some(last) = self.db.last_indexed(&self.index)? else {
            return Ok(out);
        };

        for child in 0..=last {
            let key = KeyId::new(self.subaccount, self.kind, child);
            let pubkey = self.keys.pubkey(&key).ok_or(WalletError::UnknownKey(key))?;
            for (_, script) in key_scripts(&pubkey) {
                out.insert(script.to_bytes(), key);
            }
        }

        Ok(out)
    }

    /// Outpoints whose spend we watch for.
    fn tracked_outpoints(&self) -> WalletResult<BTreeSet<Outpoint>> {
        let mut out = BTreeSet::new();
        for (outpoint, record) in self.db.outputs(None)? {
            if record.state.is_unspent() {
                out.insert(outpoint);
            }
        }
        Ok(out)
    }
}
