//! Pending proposal management: retries unfunded proposals, expires
//! stale ones, and forgets proposals whose transactions confirmed.

use std::collections::BTreeSet;
use std::sync::Arc;

use bitcoin::consensus::serialize;
use bitcoin::Transaction;
use parking_lot::Mutex;
use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_db::types::{ProposalRecord, SpendPolicy};
use cinder_primitives::buf::Buf32;
use cinder_primitives::params::Chain;

use crate::errors::WalletResult;
use crate::keys::KeySource;
use crate::spend::builder::{BuilderError, TransactionBuilder};

pub struct Proposals<D, K> {
    db: Arc<D>,
    keys: Arc<K>,
    chain: Chain,
    fee_rate: u64,
    policy: SpendPolicy,
    pending: Mutex<BTreeSet<Buf32>>,
}

impl<D: WalletDatabase, K: KeySource> Proposals<D, K> {
    pub fn new(db: Arc<D>, keys: Arc<K>, chain: Chain, fee_rate: u64) -> Self {
        Self {
            db,
            keys,
            chain,
            fee_rate,
            policy: SpendPolicy::default(),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Restores the pending set from storage after a restart.
    pub fn load(&self) -> WalletResult<()> {
        let mut pending = self.pending.lock();
        for record in self.db.load_proposals()? {
            if record.finished_tx.is_none() {
                pending.insert(record.id);
            }
        }
        Ok(())
    }

    /// Registers a new proposal for building.
    pub fn add(&self, record: ProposalRecord) -> WalletResult<()> {
        debug!(id = %record.id, spender = %record.spender, "accepted spend proposal");
        self.db.add_proposal(&record)?;
        self.pending.lock().insert(record.id);
        Ok(())
    }

    pub fn pending(&self) -> BTreeSet<Buf32> {
        self.pending.lock().clone()
    }

    /// Abandons a proposal, releasing its reservations.
    pub fn cancel(&self, id: &Buf32) -> WalletResult<()> {
        info!(%id, "cancelling proposal");
        self.db.release_proposal(id)?;
        self.db.forget_proposals(&[*id].into())?;
        self.pending.lock().remove(id);
        Ok(())
    }

    /// One pass over the pending set.  Returns the transactions
    /// finalized this round, ready for broadcast.
    pub fn run(&self, now: u64) -> Vec<(Buf32, Transaction)> {
        let candidates = self.pending();
        let mut finished = Vec::new();

        for id in candidates {
            let record = match self.db.load_proposal(&id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.pending.lock().remove(&id);
                    continue;
                }
                Err(err) => {
                    warn!(%id, %err, "failed to load proposal");
                    continue;
                }
            };

            if record.expires != 0 && record.expires < now {
                info!(%id, "proposal expired");
                if let Err(err) = self.cancel(&id) {
                    warn!(%id, %err, "failed to cancel expired proposal");
                }
                continue;
            }

            match self.build(&record) {
                Ok(tx) => {
                    self.pending.lock().remove(&id);
                    finished.push((id, tx));
                }
                Err(BuilderError::InsufficientFunds { required, reserved }) => {
                    // Not fatal; a later confirmation may fund it.
                    debug!(%id, required, reserved, "proposal not fundable yet");
                }
                Err(err) => {
                    warn!(%id, %err, "proposal failed, abandoning");
                    if let Err(err) = self.cancel(&id) {
                        warn!(%id, %err, "failed to cancel broken proposal");
                    }
                }
            }
        }

        finished
    }

    /// Drops records for proposals whose transactions have confirmed.
    pub fn forget_confirmed(&self) -> WalletResult<()> {
        let completed = self.db.completed_proposals()?;
        if completed.is_empty() {
            return Ok(());
        }

        debug!(count = completed.len(), "forgetting confirmed proposals");
        self.db.forget_proposals(&completed)?;
        let mut pending = self.pending.lock();
        for id in completed {
            pending.remove(&id);
        }
        Ok(())
    }

    fn build(&self, record: &ProposalRecord) -> Result<Transaction, BuilderError> {
        let mut builder = TransactionBuilder::new(
            self.db.as_ref(),
            self.keys.as_ref(),
            self.chain,
            record,
            self.fee_rate,
        );

        builder.create_outputs()?;
        builder.add_inputs(&self.policy)?;
        builder.add_change()?;

        let tx = match builder.finalize() {
            Ok(tx) => tx,
            Err(err) => {
                // Give the inputs back before surfacing the failure.
                let _ = builder.release();
                return Err(err);
            }
        };

        let change_keys = builder.change_keys();
        if let Err(err) =
            self.db
                .add_outgoing_transaction(&record.id, record, &tx, &change_keys)
        {
            let _ = builder.release();
            return Err(err.into());
        }

        let mut updated = record.clone();
        updated.finished_tx = Some(serialize(&tx));
        self.db.add_proposal(&updated)?;

        info!(
            id = %record.id,
            txid = %Buf32::from(tx.compute_txid()),
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            "finalized spend proposal"
        );

        Ok(tx)
    }
}
