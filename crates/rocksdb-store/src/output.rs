//! UTXO store: the primary output table plus every index the balance
//! and selection queries need.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rockbound::{SchemaBatch, DB};
use tracing::*;

use cinder_db::traits::OutputStore;
use cinder_db::types::*;
use cinder_db::{DbError, DbResult};
use cinder_primitives::hash;
use cinder_primitives::prelude::*;

use crate::cache::TableCache;
use crate::schemas::*;
use crate::{backend_err, codec_err};

/// Key under [`WalletStateSchema`] holding the best processed position.
pub(crate) const WALLET_POSITION_KEY: u8 = 0;

/// Accumulates one logical mutation before it is committed as a single
/// write batch.
#[derive(Default)]
struct TxCtx {
    outputs: BTreeMap<Outpoint, OutputRecord>,
    states: BTreeMap<TxoState, BTreeSet<Outpoint>>,
    nyms: BTreeMap<NymId, BTreeSet<Outpoint>>,
    accounts: BTreeMap<(NymId, SubaccountId), BTreeSet<Outpoint>>,
    keys: BTreeMap<KeyId, BTreeSet<Outpoint>>,
    txids: BTreeMap<Buf32, BTreeSet<Outpoint>>,
    contacts: BTreeMap<Buf32, BTreeSet<Buf32>>,
    completed: Vec<Buf32>,
    position: Option<BlockPosition>,
}

pub struct OutputDb {
    db: Arc<DB>,
    chain: Chain,
    write_lock: Mutex<()>,
    outputs: TableCache<Outpoint, OutputRecord>,
    states: TableCache<TxoState, BTreeSet<Outpoint>>,
    position: TableCache<u8, BlockPosition>,
}

impl OutputDb {
    pub fn new(db: Arc<DB>, chain: Chain) -> Self {
        Self {
            db,
            chain,
            write_lock: Mutex::new(()),
            outputs: TableCache::new(),
            states: TableCache::new(),
            position: TableCache::new(),
        }
    }

    pub fn flush_caches(&self) {
        self.outputs.clear();
        self.states.clear();
        self.position.clear();
    }

    fn load_output(&self, outpoint: &Outpoint) -> DbResult<Option<OutputRecord>> {
        self.outputs.get_or_load(outpoint, || {
            self.db.get::<OutputSchema>(outpoint).map_err(backend_err)
        })
    }

    fn state_set(&self, state: TxoState) -> DbResult<BTreeSet<Outpoint>> {
        Ok(self
            .states
            .get_or_load(&state, || {
                self.db.get::<StateIndexSchema>(&state).map_err(backend_err)
            })?
            .unwrap_or_default())
    }

    fn ctx_output(&self, ctx: &TxCtx, outpoint: &Outpoint) -> DbResult<Option<OutputRecord>> {
        if let Some(record) = ctx.outputs.get(outpoint) {
            return Ok(Some(record.clone()));
        }
        self.load_output(outpoint)
    }

    fn ctx_state_set<'c>(
        &self,
        ctx: &'c mut TxCtx,
        state: TxoState,
    ) -> DbResult<&'c mut BTreeSet<Outpoint>> {
        if !ctx.states.contains_key(&state) {
            let set = self.state_set(state)?;
            ctx.states.insert(state, set);
        }
        Ok(ctx.states.get_mut(&state).expect("output: state set present"))
    }

    /// Registers `record` (new or updated) under `outpoint`, moving it
    /// between state index sets as needed.
    fn ctx_put(
        &self,
        ctx: &mut TxCtx,
        outpoint: Outpoint,
        old_state: Option<TxoState>,
        record: OutputRecord,
    ) -> DbResult<()> {
        if let Some(old) = old_state {
            if old != record.state {
                self.ctx_state_set(ctx, old)?.remove(&outpoint);
            }
        }
        self.ctx_state_set(ctx, record.state)?.insert(outpoint);

        ctx.nyms.entry(record.nym).or_default().insert(outpoint);
        ctx.accounts
            .entry((record.nym, record.subaccount))
            .or_default()
            .insert(outpoint);
        for key in &record.keys {
            ctx.keys.entry(*key).or_default().insert(outpoint);
        }

        ctx.outputs.insert(outpoint, record);
        Ok(())
    }

    fn commit(&self, ctx: TxCtx) -> DbResult<()> {
        let mut batch = SchemaBatch::new();

        for (outpoint, record) in &ctx.outputs {
            batch
                .put::<OutputSchema>(outpoint, record)
                .map_err(codec_err)?;
        }
        for (state, set) in &ctx.states {
            batch.put::<StateIndexSchema>(state, set).map_err(codec_err)?;
        }
        for (nym, set) in &ctx.nyms {
            let mut merged = self
                .db
                .get::<NymIndexSchema>(nym)
                .map_err(backend_err)?
                .unwrap_or_default();
            merged.extend(set.iter().copied());
            batch
                .put::<NymIndexSchema>(nym, &merged)
                .map_err(codec_err)?;
        }
        for (account, set) in &ctx.accounts {
            let mut merged = self
                .db
                .get::<AccountIndexSchema>(account)
                .map_err(backend_err)?
                .unwrap_or_default();
            merged.extend(set.iter().copied());
            batch
                .put::<AccountIndexSchema>(account, &merged)
                .map_err(codec_err)?;
        }
        for (key, set) in &ctx.keys {
            let mut merged = self
                .db
                .get::<KeyIndexSchema>(key)
                .map_err(backend_err)?
                .unwrap_or_default();
            merged.extend(set.iter().copied());
            batch
                .put::<KeyIndexSchema>(key, &merged)
                .map_err(codec_err)?;
        }
        for (txid, set) in &ctx.txids {
            let mut merged = self
                .db
                .get::<TxidIndexSchema>(txid)
                .map_err(backend_err)?
                .unwrap_or_default();
            merged.extend(set.iter().copied());
            batch
                .put::<TxidIndexSchema>(txid, &merged)
                .map_err(codec_err)?;
        }
        for (pattern, contacts) in &ctx.contacts {
            let mut merged = self
                .db
                .get::<ContactIndexSchema>(pattern)
                .map_err(backend_err)?
                .unwrap_or_default();
            merged.extend(contacts.iter().copied());
            batch
                .put::<ContactIndexSchema>(pattern, &merged)
                .map_err(codec_err)?;
        }
        for proposal in &ctx.completed {
            batch
                .put::<CompletedProposalSchema>(proposal, &())
                .map_err(codec_err)?;
        }
        if let Some(position) = &ctx.position {
            batch
                .put::<WalletStateSchema>(&WALLET_POSITION_KEY, position)
                .map_err(codec_err)?;
        }

        if let Err(e) = self.db.write_schemas(batch) {
            // The caches may hold rows the failed batch never landed, so
            // rebuild them from disk.
            self.flush_caches();
            return Err(backend_err(e));
        }

        for (outpoint, record) in ctx.outputs {
            self.outputs.put(outpoint, record);
        }
        for (state, set) in ctx.states {
            self.states.put(state, set);
        }
        if let Some(position) = ctx.position {
            self.position.put(WALLET_POSITION_KEY, position);
        }

        Ok(())
    }

    fn balance_where(&self, filter: impl Fn(&OutputRecord) -> bool) -> DbResult<Balance> {
        let mut balance = Balance::default();

        for state in [
            TxoState::ConfirmedNew,
            TxoState::Reserved,
            TxoState::UnconfirmedNew,
            TxoState::Immature,
        ] {
            for outpoint in self.state_set(state)? {
                let Some(record) = self.load_output(&outpoint)? else {
                    continue;
                };
                if !filter(&record) {
                    continue;
                }
                if matches!(state, TxoState::ConfirmedNew | TxoState::Reserved) {
                    balance.confirmed += record.value;
                }
                balance.unconfirmed += record.value;
            }
        }

        Ok(balance)
    }

    fn outputs_where(
        &self,
        state: Option<TxoState>,
        filter: impl Fn(&OutputRecord) -> bool,
    ) -> DbResult<TxoSet> {
        let states: Vec<TxoState> = match state {
            Some(state) => vec![state],
            None => vec![
                TxoState::UnconfirmedNew,
                TxoState::ConfirmedNew,
                TxoState::UnconfirmedSpend,
                TxoState::ConfirmedSpend,
                TxoState::OrphanedNew,
                TxoState::OrphanedSpend,
                TxoState::Immature,
                TxoState::Reserved,
            ],
        };

        let mut out = TxoSet::new();
        for state in states {
            for outpoint in self.state_set(state)? {
                let Some(record) = self.load_output(&outpoint)? else {
                    continue;
                };
                if filter(&record) {
                    out.push((outpoint, record));
                }
            }
        }
        Ok(out)
    }

    fn confirm_output(
        &self,
        ctx: &mut TxCtx,
        nym: &NymId,
        subaccount: &SubaccountId,
        position: &BlockPosition,
        tx: &bitcoin::Transaction,
        txid: Buf32,
        vout: u32,
        key: KeyId,
        created: &mut TxoSet,
    ) -> DbResult<()> {
        let txout = tx
            .output
            .get(vout as usize)
            .ok_or_else(|| DbError::Other(format!("tx {txid} has no output {vout}")))?;
        let outpoint = Outpoint::new(txid, vout);
        let coinbase = tx.is_coinbase();
        let target = if coinbase {
            TxoState::Immature
        } else {
            TxoState::ConfirmedNew
        };

        let record = match self.ctx_output(ctx, &outpoint)? {
            Some(mut existing) => {
                let old = existing.state;
                match old {
                    TxoState::UnconfirmedNew | TxoState::OrphanedNew | TxoState::Immature => {
                        existing.state = target;
                    }
                    // Re-confirmation of the same output is a no-op.
                    TxoState::ConfirmedNew => {}
                    state => {
                        return Err(DbError::InvalidStateTransition(state, target));
                    }
                }
                existing.position = *position;
                self.ctx_put(ctx, outpoint, Some(old), existing.clone())?;
                existing
            }
            None => {
                let mut record = OutputRecord::new(
                    txout.value.to_sat(),
                    txout.script_pubkey.to_bytes(),
                    target,
                    *position,
                    *nym,
                    *subaccount,
                    vec![key],
                );
                record.tags.insert(if coinbase {
                    TxoTag::Generation
                } else {
                    TxoTag::Normal
                });
                self.ctx_put(ctx, outpoint, None, record.clone())?;
                record
            }
        };

        ctx.txids.entry(txid).or_default().insert(outpoint);
        created.push((outpoint, record));
        Ok(())
    }

    fn spend_output(
        &self,
        ctx: &mut TxCtx,
        txid: Buf32,
        input: &bitcoin::TxIn,
        spent_at: Option<&BlockPosition>,
        consumed: &mut TxoSet,
    ) -> DbResult<()> {
        let outpoint: Outpoint = input.previous_output.into();
        let Some(mut record) = self.ctx_output(ctx, &outpoint)? else {
            return Ok(());
        };

        let target = if spent_at.is_some() {
            TxoState::ConfirmedSpend
        } else {
            TxoState::UnconfirmedSpend
        };
        if record.state == target {
            return Ok(());
        }

        // A spend confirming settles any proposal holding the output.
        if spent_at.is_some() {
            if let Some(proposal) = record.proposal {
                ctx.completed.push(proposal);
            }
        }

        let old = record.state;
        record.state = target;
        // Track the position of the spending block so a reorg above it
        // can roll the spend back.
        if let Some(position) = spent_at {
            record.position = *position;
        }
        self.ctx_put(ctx, outpoint, Some(old), record.clone())?;
        ctx.txids.entry(txid).or_default().insert(outpoint);
        consumed.push((outpoint, record));
        Ok(())
    }
}

impl OutputStore for OutputDb {
    fn add_confirmed_transactions(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        _subchain: &SubchainIndex,
        matches: &BatchedMatches,
        created: &mut TxoSet,
        consumed: &mut TxoSet,
    ) -> DbResult<()> {
        if matches.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();

        for (position, transactions) in matches {
            for matched in transactions {
                let txid: Buf32 = matched.tx.compute_txid().into();

                for (vout, key) in &matched.matched_outputs {
                    self.confirm_output(
                        &mut ctx, nym, subaccount, position, &matched.tx, txid, *vout, *key,
                        created,
                    )?;
                }

                if !matched.tx.is_coinbase() {
                    for input in &matched.tx.input {
                        self.spend_output(&mut ctx, txid, input, Some(position), consumed)?;
                    }
                }
            }
        }

        let best = matches.keys().last().expect("output: non-empty matches");
        let current = self.position()?;
        if *best > current {
            ctx.position = Some(*best);
        }

        self.commit(ctx)?;
        debug!(
            chain = %self.chain,
            created = created.len(),
            consumed = consumed.len(),
            "recorded confirmed transactions"
        );
        Ok(())
    }

    fn add_mempool_transaction(
        &self,
        nym: &NymId,
        subaccount: &SubaccountId,
        matched: &MatchedTransaction,
        created: &mut TxoSet,
    ) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();
        let txid: Buf32 = matched.tx.compute_txid().into();
        let blank = BlockPosition::blank();

        for (vout, key) in &matched.matched_outputs {
            let txout = matched
                .tx
                .output
                .get(*vout as usize)
                .ok_or_else(|| DbError::Other(format!("tx {txid} has no output {vout}")))?;
            let outpoint = Outpoint::new(txid, *vout);

            if self.ctx_output(&ctx, &outpoint)?.is_some() {
                // Already known, likely via a confirmed block.
                continue;
            }

            let record = OutputRecord::new(
                txout.value.to_sat(),
                txout.script_pubkey.to_bytes(),
                TxoState::UnconfirmedNew,
                blank,
                *nym,
                *subaccount,
                vec![*key],
            );
            self.ctx_put(&mut ctx, outpoint, None, record.clone())?;
            ctx.txids.entry(txid).or_default().insert(outpoint);
            created.push((outpoint, record));
        }

        let mut consumed = TxoSet::new();
        for input in &matched.tx.input {
            self.spend_output(&mut ctx, txid, input, None, &mut consumed)?;
        }

        self.commit(ctx)
    }

    fn add_outgoing_transaction(
        &self,
        proposal: &Buf32,
        record: &ProposalRecord,
        tx: &bitcoin::Transaction,
        change_keys: &[(u32, KeyId)],
    ) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();
        let txid: Buf32 = tx.compute_txid().into();
        let blank = BlockPosition::blank();

        for input in &tx.input {
            let outpoint: Outpoint = input.previous_output.into();
            let mut output = self
                .ctx_output(&ctx, &outpoint)?
                .ok_or(DbError::UnknownOutput(outpoint))?;

            if output.proposal.as_ref() != Some(proposal) {
                return Err(DbError::Other(format!(
                    "output {outpoint} is not reserved by proposal {proposal}"
                )));
            }
            if output.state != TxoState::Reserved {
                return Err(DbError::InvalidStateTransition(
                    output.state,
                    TxoState::UnconfirmedSpend,
                ));
            }

            output.state = TxoState::UnconfirmedSpend;
            self.ctx_put(&mut ctx, outpoint, Some(TxoState::Reserved), output)?;
            ctx.txids.entry(txid).or_default().insert(outpoint);
        }

        for (vout, key) in change_keys {
            let txout = tx
                .output
                .get(*vout as usize)
                .ok_or_else(|| DbError::Other(format!("tx {txid} has no output {vout}")))?;
            let outpoint = Outpoint::new(txid, *vout);

            let mut change = OutputRecord::new(
                txout.value.to_sat(),
                txout.script_pubkey.to_bytes(),
                TxoState::UnconfirmedNew,
                blank,
                record.spender,
                key.subaccount,
                vec![*key],
            );
            change.tags.insert(TxoTag::Change);
            change.proposal = Some(*proposal);
            self.ctx_put(&mut ctx, outpoint, None, change)?;
            ctx.txids.entry(txid).or_default().insert(outpoint);
        }

        // Contact attribution for the requested payments.
        for payment in &record.payments {
            if let Some(contact) = payment.contact {
                let pattern = hash::sha256d(&payment.script);
                ctx.contacts.entry(pattern).or_default().insert(contact);
            }
        }

        self.commit(ctx)
    }

    fn reserve_utxo(
        &self,
        spender: &NymId,
        proposal: &Buf32,
        policy: &SpendPolicy,
    ) -> DbResult<Option<(Outpoint, OutputRecord)>> {
        let _guard = self.write_lock.lock();
        let height = self.position()?.height();

        let mut best: Option<(Outpoint, OutputRecord)> = None;
        for outpoint in self.state_set(TxoState::ConfirmedNew)? {
            let Some(record) = self.load_output(&outpoint)? else {
                continue;
            };
            if record.nym != *spender {
                continue;
            }
            if policy.min_confirmations > 0 {
                let confirmations = height - record.position.height() + 1;
                if confirmations < policy.min_confirmations {
                    continue;
                }
            }
            if policy.segwit_only && !is_p2wpkh(&record.script) {
                continue;
            }

            let better = match &best {
                Some((_, current)) => record.value > current.value,
                None => true,
            };
            if better {
                best = Some((outpoint, record));
            }
        }

        let Some((outpoint, mut record)) = best else {
            return Ok(None);
        };

        record.state = TxoState::Reserved;
        record.proposal = Some(*proposal);

        let mut ctx = TxCtx::default();
        self.ctx_put(&mut ctx, outpoint, Some(TxoState::ConfirmedNew), record.clone())?;
        self.commit(ctx)?;

        Ok(Some((outpoint, record)))
    }

    fn release_proposal(&self, proposal: &Buf32) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();

        for outpoint in self.state_set(TxoState::Reserved)? {
            let Some(mut record) = self.load_output(&outpoint)? else {
                continue;
            };
            if record.proposal.as_ref() != Some(proposal) {
                continue;
            }
            record.state = TxoState::ConfirmedNew;
            record.proposal = None;
            self.ctx_put(&mut ctx, outpoint, Some(TxoState::Reserved), record)?;
        }

        self.commit(ctx)
    }

    fn advance_to(&self, position: &BlockPosition) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();
        let matured_below = position.height() - self.chain.maturity_window();

        for outpoint in self.state_set(TxoState::Immature)? {
            let Some(mut record) = self.load_output(&outpoint)? else {
                continue;
            };
            if record.position.height() > matured_below {
                continue;
            }
            record.state = TxoState::ConfirmedNew;
            self.ctx_put(&mut ctx, outpoint, Some(TxoState::Immature), record)?;
        }

        let current = self.position()?;
        if *position > current {
            ctx.position = Some(*position);
        }

        self.commit(ctx)
    }

    fn reorg_to(&self, ancestor: &BlockPosition, reorged: &[BlockPosition]) -> DbResult<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = TxCtx::default();
        let reorged: BTreeSet<&BlockPosition> = reorged.iter().collect();

        for (state, target) in [
            (TxoState::ConfirmedNew, TxoState::OrphanedNew),
            (TxoState::Immature, TxoState::OrphanedNew),
            (TxoState::ConfirmedSpend, TxoState::OrphanedSpend),
        ] {
            for outpoint in self.state_set(state)? {
                let Some(mut record) = self.load_output(&outpoint)? else {
                    continue;
                };
                let above = record.position.height() > ancestor.height();
                if !above && !reorged.contains(&record.position) {
                    continue;
                }
                record.state = target;
                record.position = BlockPosition::blank();
                self.ctx_put(&mut ctx, outpoint, Some(state), record)?;
            }
        }

        let current = self.position()?;
        if current > *ancestor {
            ctx.position = Some(*ancestor);
        }

        self.commit(ctx)?;
        info!(chain = %self.chain, %ancestor, "rolled wallet outputs back");
        Ok(())
    }

    fn position(&self) -> DbResult<BlockPosition> {
        Ok(self
            .position
            .get_or_load(&WALLET_POSITION_KEY, || {
                self.db
                    .get::<WalletStateSchema>(&WALLET_POSITION_KEY)
                    .map_err(backend_err)
            })?
            .unwrap_or_else(BlockPosition::blank))
    }

    fn balance(&self) -> DbResult<Balance> {
        self.balance_where(|_| true)
    }

    fn balance_for_nym(&self, nym: &NymId) -> DbResult<Balance> {
        self.balance_where(|record| record.nym == *nym)
    }

    fn balance_for_account(&self, nym: &NymId, subaccount: &SubaccountId) -> DbResult<Balance> {
        self.balance_where(|record| record.nym == *nym && record.subaccount == *subaccount)
    }

    fn balance_for_key(&self, key: &KeyId) -> DbResult<Balance> {
        self.balance_where(|record| record.keys.contains(key))
    }

    fn outputs(&self, state: Option<TxoState>) -> DbResult<TxoSet> {
        self.outputs_where(state, |_| true)
    }

    fn outputs_for_nym(&self, nym: &NymId, state: Option<TxoState>) -> DbResult<TxoSet> {
        self.outputs_where(state, |record| record.nym == *nym)
    }

    fn output(&self, outpoint: &Outpoint) -> DbResult<Option<OutputRecord>> {
        self.load_output(outpoint)
    }

    fn transactions(&self) -> DbResult<Vec<Buf32>> {
        let iter = self.db.iter::<TxidIndexSchema>().map_err(backend_err)?.into_iter();
        let mut out = Vec::new();
        for item in iter {
            let (txid, _) = item.map_err(backend_err)?.into_tuple();
            out.push(txid);
        }
        Ok(out)
    }

    fn lookup_contact(&self, pattern_hash: &Buf32) -> DbResult<BTreeSet<Buf32>> {
        Ok(self
            .db
            .get::<ContactIndexSchema>(pattern_hash)
            .map_err(backend_err)?
            .unwrap_or_default())
    }
}

fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == 0x00 && script[1] == 0x14
}
