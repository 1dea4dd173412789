//! The wallet coordinator: a single-consumer actor gluing external
//! events and requests to the account fan-out and the proposal
//! pipeline.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::Transaction;
use tokio::sync::{mpsc, oneshot};
use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_db::types::{ProposalRecord, TxoSet, TxoState};
use cinder_filters::{BlockOracle, HeaderOracle};
use cinder_primitives::prelude::*;
use cinder_status::{StatusPublisher, WalletEvent};
use cinder_tasks::ShutdownGuard;

use crate::accounts::Accounts;
use crate::errors::WalletResult;
use crate::keys::KeySource;
use crate::spend::Proposals;
use crate::subchain::{FilterSource, ScannerConfig};

/// Requests and events accepted by the coordinator's inbox.
pub enum WalletCommand {
    NewFilterTip(BlockPosition),
    BlockAvailable,
    MempoolTx(Box<Transaction>),
    NewKey { subaccount: SubaccountId },
    NewSubaccount { subaccount: SubaccountId },
    Reorg { ancestor: BlockPosition },
    SubmitProposal(Box<ProposalRecord>),
    CancelProposal(Buf32),
    GetBalance(oneshot::Sender<Balance>),
    GetOutputs(Option<TxoState>, oneshot::Sender<TxoSet>),
    Shutdown,
}

/// Worker threads for CPU-bound scan and match work.
const SCAN_POOL_SIZE: usize = 4;

/// Cap on concurrent subchain jobs across all accounts.
const MAX_JOBS: usize = 8;

pub struct Wallet<D, K> {
    nym: NymId,
    chain: Chain,
    db: Arc<D>,
    accounts: Accounts<D, K>,
    proposals: Proposals<D, K>,
    status: Arc<StatusPublisher>,
    pool: threadpool::ThreadPool,
    jobs: crate::JobCounter,
}

impl<D: WalletDatabase, K: KeySource> Wallet<D, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nym: NymId,
        chain: Chain,
        db: Arc<D>,
        keys: Arc<K>,
        filters: Arc<dyn FilterSource>,
        blocks: Arc<dyn BlockOracle>,
        headers: Arc<dyn HeaderOracle>,
        status: Arc<StatusPublisher>,
        config: ScannerConfig,
        fee_rate: u64,
    ) -> Self {
        let accounts = Accounts::new(
            nym,
            chain,
            db.clone(),
            keys.clone(),
            filters,
            blocks,
            headers,
            status.clone(),
            config,
        );
        let proposals = Proposals::new(db.clone(), keys, chain, fee_rate);

        Self {
            nym,
            chain,
            db,
            accounts,
            proposals,
            status,
            pool: threadpool::ThreadPool::new(SCAN_POOL_SIZE),
            jobs: crate::JobCounter::new(MAX_JOBS),
        }
    }

    pub fn accounts(&self) -> &Accounts<D, K> {
        &self.accounts
    }

    pub fn proposals(&self) -> &Proposals<D, K> {
        &self.proposals
    }

    pub fn balance(&self) -> WalletResult<Balance> {
        Ok(self.db.balance_for_nym(&self.nym)?)
    }

    pub fn outputs(&self, state: Option<TxoState>) -> WalletResult<TxoSet> {
        Ok(self.db.outputs_for_nym(&self.nym, state)?)
    }

    /// New cfilter tip: scan, mature coinbases, and retry pending
    /// proposals against the refreshed UTXO set.
    pub fn handle_new_filter_tip(&self, tip: &BlockPosition) -> WalletResult<Vec<Transaction>> {
        self.db.advance_to(tip)?;
        self.accounts.on_new_filter_tip()?;
        self.proposals.forget_confirmed()?;

        let finished = self.proposals.run(unix_now());
        Ok(finished.into_iter().map(|(_, tx)| tx).collect())
    }

    pub fn handle_block_available(&self) -> WalletResult<bool> {
        self.accounts.on_block_available()
    }

    pub fn handle_mempool_tx(&self, tx: &Transaction) -> WalletResult<bool> {
        self.accounts.on_mempool_tx(tx)
    }

    /// Inspects everything currently admitted to the mempool, used at
    /// startup before the subscription stream takes over.
    pub fn sweep_mempool(&self, mempool: &dyn crate::Mempool) -> WalletResult<usize> {
        let mut hits = 0;
        for txid in mempool.dump() {
            let Some(tx) = mempool.query(&txid) else {
                continue;
            };
            if self.handle_mempool_tx(&tx)? {
                hits += 1;
            }
        }
        Ok(hits)
    }

    pub fn handle_new_key(&self, subaccount: &SubaccountId) -> WalletResult<bool> {
        self.accounts.on_new_key(subaccount)
    }

    pub fn handle_new_subaccount(&self, subaccount: &SubaccountId) -> WalletResult<bool> {
        self.accounts.ensure_account(subaccount)?;
        self.accounts.on_new_key(subaccount)
    }

    /// Fans the reorg out to every account and publishes the result.
    /// An aborted rollback propagates up and terminates the chain.
    pub fn handle_reorg(&self, ancestor: &BlockPosition) -> WalletResult<()> {
        self.accounts.on_reorg(ancestor)?;
        self.status.publish(WalletEvent::ReorgDone {
            chain: self.chain,
            ancestor: *ancestor,
        });
        Ok(())
    }

    pub fn submit_proposal(&self, record: ProposalRecord) -> WalletResult<Vec<Transaction>> {
        self.proposals.add(record)?;
        let finished = self.proposals.run(unix_now());
        Ok(finished.into_iter().map(|(_, tx)| tx).collect())
    }

    /// Actor loop: consumes the inbox until shutdown, then drains the
    /// accounts.  Intended to run on a dedicated thread.
    pub fn run(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<WalletCommand>,
        shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        info!(nym = %self.nym, chain = %self.chain, "wallet coordinator starting");
        self.proposals.load()?;

        while let Some(command) = inbox.blocking_recv() {
            if shutdown.should_shutdown() {
                break;
            }

            match command {
                WalletCommand::NewFilterTip(tip) => {
                    // Scan work runs on the CPU pool; proposal
                    // maintenance stays on the actor thread.
                    if let Err(err) = self.db.advance_to(&tip) {
                        error!(%err, "failed to advance wallet position");
                    }
                    self.accounts.dispatch_ticks(&self.pool, &self.jobs);
                    if let Err(err) = self.proposals.forget_confirmed() {
                        error!(%err, "failed to forget confirmed proposals");
                    }
                    self.proposals.run(unix_now());
                }
                WalletCommand::BlockAvailable => {
                    if let Err(err) = self.handle_block_available() {
                        error!(%err, "failed to process available blocks");
                    }
                }
                WalletCommand::MempoolTx(tx) => {
                    if let Err(err) = self.handle_mempool_tx(&tx) {
                        error!(%err, "failed to process mempool transaction");
                    }
                }
                WalletCommand::NewKey { subaccount } => {
                    if let Err(err) = self.handle_new_key(&subaccount) {
                        error!(%err, "failed to index new keys");
                    }
                }
                WalletCommand::NewSubaccount { subaccount } => {
                    if let Err(err) = self.handle_new_subaccount(&subaccount) {
                        error!(%err, "failed to add subaccount");
                    }
                }
                WalletCommand::Reorg { ancestor } => {
                    // A failed rollback leaves derived state
                    // inconsistent; terminate the chain.
                    self.handle_reorg(&ancestor)?;
                }
                WalletCommand::SubmitProposal(record) => {
                    if let Err(err) = self.submit_proposal(*record) {
                        error!(%err, "failed to submit proposal");
                    }
                }
                WalletCommand::CancelProposal(id) => {
                    if let Err(err) = self.proposals.cancel(&id) {
                        error!(%id, %err, "failed to cancel proposal");
                    }
                }
                WalletCommand::GetBalance(reply) => {
                    let _ = reply.send(self.balance().unwrap_or_default());
                }
                WalletCommand::GetOutputs(state, reply) => {
                    let _ = reply.send(self.outputs(state).unwrap_or_default());
                }
                WalletCommand::Shutdown => break,
            }
        }

        self.accounts.shutdown();
        info!(nym = %self.nym, "wallet coordinator exiting");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
