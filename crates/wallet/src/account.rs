//! One HD / payment-code subaccount and its subchains.

use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_filters::{BlockOracle, HeaderOracle};
use cinder_primitives::prelude::*;
use cinder_status::StatusPublisher;

use crate::errors::WalletResult;
use crate::keys::KeySource;
use crate::subchain::{FilterSource, ScannerConfig, SubchainState, SubchainStateData};

/// Subchains every subaccount scans.
const DEFAULT_SUBCHAINS: [SubchainKind; 2] = [SubchainKind::External, SubchainKind::Internal];

pub struct Account<D, K> {
    subaccount: SubaccountId,
    subchains: Vec<Arc<SubchainStateData<D, K>>>,
}

impl<D: WalletDatabase, K: KeySource> Account<D, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nym: NymId,
        subaccount: SubaccountId,
        chain: Chain,
        db: Arc<D>,
        keys: Arc<K>,
        filters: Arc<dyn FilterSource>,
        blocks: Arc<dyn BlockOracle>,
        headers: Arc<dyn HeaderOracle>,
        status: Arc<StatusPublisher>,
        config: ScannerConfig,
    ) -> WalletResult<Self> {
        let mut subchains = Vec::new();
        for kind in DEFAULT_SUBCHAINS {
            subchains.push(Arc::new(SubchainStateData::new(
                nym,
                subaccount,
                kind,
                chain,
                db.clone(),
                keys.clone(),
                filters.clone(),
                blocks.clone(),
                headers.clone(),
                status.clone(),
                config,
            )?));
        }

        debug!(%subaccount, "account instantiated");
        Ok(Self {
            subaccount,
            subchains,
        })
    }

    pub fn subaccount(&self) -> &SubaccountId {
        &self.subaccount
    }

    pub fn subchains(&self) -> &[Arc<SubchainStateData<D, K>>] {
        &self.subchains
    }

    /// Runs one scan cycle on every subchain.
    pub fn tick(&self) -> WalletResult<bool> {
        let mut advanced = false;
        for subchain in &self.subchains {
            advanced |= subchain.tick()?;
        }
        Ok(advanced)
    }

    /// Processes any candidate blocks queued by earlier scans.
    pub fn process_available(&self) -> WalletResult<bool> {
        let mut advanced = false;
        for subchain in &self.subchains {
            advanced |= subchain.process_pending()?;
        }
        Ok(advanced)
    }

    pub fn process_mempool_tx(&self, tx: &bitcoin::Transaction) -> WalletResult<bool> {
        let mut hit = false;
        for subchain in &self.subchains {
            hit |= subchain.process_mempool_tx(tx)?;
        }
        Ok(hit)
    }

    /// The reorg choreography: park every subchain, roll the database
    /// back, then return them to normal operation.  Failures land in
    /// the shared counter.
    pub fn process_reorg(&self, ancestor: &BlockPosition, errors: &AtomicI32) {
        for subchain in &self.subchains {
            subchain.change_state(SubchainState::PreReorg);
            subchain.drain();
            subchain.change_state(SubchainState::Reorg);
            subchain.process_reorg(ancestor, errors);
        }

        for subchain in &self.subchains {
            subchain.change_state(SubchainState::PostReorg);
            subchain.change_state(SubchainState::Normal);
        }
    }

    pub fn shutdown(&self) {
        for subchain in &self.subchains {
            subchain.change_state(SubchainState::PreShutdown);
            subchain.drain();
            subchain.change_state(SubchainState::Shutdown);
        }
    }
}
