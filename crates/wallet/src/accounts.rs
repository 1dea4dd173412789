//! Fan-out over every subaccount of one (nym, chain).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_filters::{BlockOracle, HeaderOracle};
use cinder_primitives::prelude::*;
use cinder_status::StatusPublisher;

use crate::account::Account;
use crate::errors::{WalletError, WalletResult};
use crate::keys::KeySource;
use crate::subchain::{FilterSource, ScannerConfig};

pub struct Accounts<D, K> {
    nym: NymId,
    chain: Chain,
    db: Arc<D>,
    keys: Arc<K>,
    filters: Arc<dyn FilterSource>,
    blocks: Arc<dyn BlockOracle>,
    headers: Arc<dyn HeaderOracle>,
    status: Arc<StatusPublisher>,
    config: ScannerConfig,
    accounts: Mutex<BTreeMap<SubaccountId, Arc<Account<D, K>>>>,
}

impl<D: WalletDatabase, K: KeySource> Accounts<D, K> {
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
    ) -> Self {
        Self {
            nym,
            chain,
            db,
            keys,
            filters,
            blocks,
            headers,
            status,
            config,
            accounts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Instantiates the subchains for a subaccount if they do not exist
    /// yet.
    pub fn ensure_account(&self, subaccount: &SubaccountId) -> WalletResult<Arc<Account<D, K>>> {
        if let Some(account) = self.accounts.lock().get(subaccount) {
            return Ok(account.clone());
        }

        let account = Arc::new(Account::new(
            self.nym,
            *subaccount,
            self.chain,
            self.db.clone(),
            self.keys.clone(),
            self.filters.clone(),
            self.blocks.clone(),
            self.headers.clone(),
            self.status.clone(),
            self.config,
        )?);
        self.accounts.lock().insert(*subaccount, account.clone());
        Ok(account)
    }

    pub fn accounts(&self) -> Vec<Arc<Account<D, K>>> {
        self.accounts.lock().values().cloned().collect()
    }

    /// Dispatches one scan cycle per subchain onto the CPU pool,
    /// bounded by the shared job counter.  Subchains that cannot claim
    /// a slot are picked up by a later dispatch.
    pub fn dispatch_ticks(&self, pool: &threadpool::ThreadPool, jobs: &crate::JobCounter) {
        for account in self.accounts() {
            for subchain in account.subchains() {
                let Some(guard) = jobs.try_claim() else {
                    trace!("job limit reached, deferring remaining subchains");
                    return;
                };
                let subchain = subchain.clone();
                pool.execute(move || {
                    let _guard = guard;
                    if let Err(err) = subchain.tick() {
                        warn!(%err, "subchain tick failed");
                    }
                });
            }
        }
    }

    /// New filter tip: every subchain gets a scan cycle.
    pub fn on_new_filter_tip(&self) -> WalletResult<bool> {
        let mut advanced = false;
        for account in self.accounts() {
            advanced |= account.tick()?;
        }
        Ok(advanced)
    }

    /// A block became available: drive the process stages.
    pub fn on_block_available(&self) -> WalletResult<bool> {
        let mut advanced = false;
        for account in self.accounts() {
            advanced |= account.process_available()?;
        }
        Ok(advanced)
    }

    pub fn on_mempool_tx(&self, tx: &bitcoin::Transaction) -> WalletResult<bool> {
        let mut hit = false;
        for account in self.accounts() {
            hit |= account.process_mempool_tx(tx)?;
        }
        Ok(hit)
    }

    /// New keys were derived for a subaccount: re-run its index stage.
    pub fn on_new_key(&self, subaccount: &SubaccountId) -> WalletResult<bool> {
        let account = self.ensure_account(subaccount)?;
        account.tick()
    }

    /// Runs the reorg choreography across every account.  The first
    /// failure aborts the fan-out and escalates.
    pub fn on_reorg(&self, ancestor: &BlockPosition) -> WalletResult<()> {
        info!(chain = %self.chain, %ancestor, "rolling wallet back");
        let errors = AtomicI32::new(0);

        for account in self.accounts() {
            account.process_reorg(ancestor, &errors);
            if errors.load(Ordering::SeqCst) > 0 {
                break;
            }
        }

        let count = errors.load(Ordering::SeqCst);
        if count > 0 {
            return Err(WalletError::ReorgAborted(count));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for account in self.accounts() {
            account.shutdown();
        }
    }
}
