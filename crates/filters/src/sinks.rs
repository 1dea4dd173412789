//! Download sinks for the three filter pipelines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use cinder_db::traits::FilterStore;
use cinder_download::{DownloadError, DownloadSink, TaskOf};
use cinder_gcs::{Gcs, GcsKey};
use cinder_primitives::hash;
use cinder_primitives::prelude::*;
use cinder_status::StatusPublisher;

use crate::checkpoints::{checkpoint_header, CheckpointMap};
use crate::elements::filter_elements;
use crate::traits::HeaderOracle;
use crate::FilterError;

/// Maximum items requested in one cfheaders/cfilters round trip.
const MAX_BATCH: usize = 2000;

/// State shared between the oracle and its sinks.
pub(crate) struct OracleShared<S, H> {
    pub chain: Chain,
    pub filter_type: FilterType,
    pub store: Arc<S>,
    pub headers: Arc<H>,
    pub status: Arc<StatusPublisher>,
    pub checkpoints: CheckpointMap,
    /// Height of a failed checkpoint or header-chain verification,
    /// consumed by the oracle's next heartbeat.
    pub pending_reset: Mutex<Option<Height>>,
    pub state_machine_requested: AtomicBool,
    pub header_batch_ready: AtomicBool,
    pub filter_batch_ready: AtomicBool,
}

impl<S: FilterStore, H: HeaderOracle> OracleShared<S, H> {
    /// Compares a computed header against the checkpoint table.
    /// Records a pending reset on mismatch.
    fn verify_checkpoint(&self, height: Height, header: &Buf32) -> bool {
        let Some(expected) = checkpoint_header(&self.checkpoints, height, self.filter_type) else {
            return true;
        };

        if expected == *header {
            trace!(%height, "cfheader matches checkpoint");
            return true;
        }

        error!(
            chain = %self.chain,
            %height,
            computed = %header,
            expected = %expected,
            "cfheader does not match checkpoint"
        );
        self.request_reset(height);
        false
    }

    fn request_reset(&self, height: Height) {
        let mut pending = self.pending_reset.lock();
        *pending = Some(pending.map_or(height, |h| h.min(height)));
    }

    /// The cfheader the predecessor of `height` carries, for filter
    /// verification.  Height zero chains onto the zero hash.
    fn previous_header(&self, height: Height) -> Option<Buf32> {
        if height == 0 {
            return Some(Buf32::zero());
        }
        let prev_hash = self.headers.best_hash(height - 1)?;
        self.store
            .load_header(self.filter_type, &prev_hash)
            .ok()
            .flatten()
    }
}

/// Downloads cfilter hashes and chains them into cfheaders.
pub struct HeaderSink<S, H> {
    pub(crate) shared: Arc<OracleShared<S, H>>,
}

impl<S: FilterStore + Send + Sync + 'static, H: HeaderOracle> DownloadSink for HeaderSink<S, H> {
    type Download = Buf32;
    type Finished = Buf32;
    type Extra = FilterType;

    fn batch_size(&self, unallocated: usize) -> usize {
        unallocated.min(MAX_BATCH)
    }

    fn batch_ready(&self) {
        self.shared.header_batch_ready.store(true, Ordering::SeqCst);
    }

    fn queue_processing(&self, tasks: Vec<Arc<TaskOf<Self>>>) {
        for task in tasks {
            let position = *task.position();

            let previous = match task.previous().get() {
                Ok(header) => header,
                Err(err) => {
                    task.process(Err(err));
                    continue;
                }
            };
            let filter_hash = match task.data().try_get() {
                Some(Ok(hash)) => hash,
                _ => {
                    task.redownload();
                    continue;
                }
            };

            let header = hash::sha256d_pair(&filter_hash, &previous);

            if !self.shared.verify_checkpoint(position.height(), &header) {
                let err = FilterError::CheckpointMismatch(position.height());
                task.process(Err(DownloadError::Invalid(err.to_string())));
                continue;
            }

            if let Err(err) = self
                .shared
                .store
                .store_headers(self.shared.filter_type, &[(*position.hash(), header)])
            {
                warn!(%position, %err, "failed to store cfheader");
                task.process(Err(DownloadError::Missing(err.to_string())));
                continue;
            }

            task.process(Ok(header));
        }
    }

    fn update_tip(&self, position: &BlockPosition, _finished: &Buf32) {
        if let Err(err) = self
            .shared
            .store
            .set_header_tip(self.shared.filter_type, position)
        {
            warn!(%position, %err, "failed to persist cfheader tip");
        }
        debug!(chain = %self.shared.chain, %position, "cfheader tip updated");
    }

    fn trigger_state_machine(&self) {
        self.shared
            .state_machine_requested
            .store(true, Ordering::SeqCst);
    }
}

/// Downloads cfilters and verifies them against the stored header
/// chain.
pub struct FilterSink<S, H> {
    pub(crate) shared: Arc<OracleShared<S, H>>,
}

impl<S: FilterStore + Send + Sync + 'static, H: HeaderOracle> DownloadSink for FilterSink<S, H> {
    type Download = Vec<u8>;
    type Finished = Gcs;
    type Extra = FilterType;

    fn batch_size(&self, unallocated: usize) -> usize {
        unallocated.min(MAX_BATCH)
    }

    fn batch_ready(&self) {
        self.shared.filter_batch_ready.store(true, Ordering::SeqCst);
    }

    fn check_task(&self, task: &TaskOf<Self>) {
        // Pre-resolve from local storage so filters fetched in an
        // earlier run are not downloaded twice.
        let block = task.position().hash();
        let Ok(Some(gcs)) = self.shared.store.load_filter(self.shared.filter_type, block) else {
            return;
        };

        if task.try_claim() {
            task.download(gcs.encoded(), None);
        }
    }

    fn queue_processing(&self, tasks: Vec<Arc<TaskOf<Self>>>) {
        for task in tasks {
            let position = *task.position();
            let encoded = match task.data().try_get() {
                Some(Ok(bytes)) => bytes,
                _ => {
                    task.redownload();
                    continue;
                }
            };

            let key = GcsKey::from_block_hash(position.hash());
            let gcs = match Gcs::from_encoded(self.shared.filter_type, key, &encoded) {
                Ok(gcs) => gcs,
                Err(err) => {
                    debug!(%position, %err, "cfilter failed to decode, redownloading");
                    task.redownload();
                    continue;
                }
            };

            // The filter must hash into the cfheader the header
            // pipeline committed for this block.
            let stored = self
                .shared
                .store
                .load_header(self.shared.filter_type, position.hash())
                .ok()
                .flatten();
            let previous = self.shared.previous_header(position.height());
            match (stored, previous) {
                (Some(stored), Some(previous)) => {
                    if gcs.header(&previous) != stored {
                        error!(%position, "cfilter does not verify against cfheader chain");
                        self.shared.request_reset(position.height());
                        let err = FilterError::HeaderChainMismatch;
                        task.process(Err(DownloadError::Invalid(err.to_string())));
                        continue;
                    }
                }
                _ => {
                    // Header not committed yet; retry on a later tick.
                    task.redownload();
                    continue;
                }
            }

            if let Err(err) = self
                .shared
                .store
                .store_filters(self.shared.filter_type, &[(*position.hash(), gcs.clone())])
            {
                warn!(%position, %err, "failed to store cfilter");
                task.process(Err(DownloadError::Missing(err.to_string())));
                continue;
            }

            task.process(Ok(gcs));
        }
    }

    fn update_tip(&self, position: &BlockPosition, _finished: &Gcs) {
        if let Err(err) = self
            .shared
            .store
            .set_filter_tip(self.shared.filter_type, position)
        {
            warn!(%position, %err, "failed to persist cfilter tip");
        }
        self.shared
            .status
            .publish_filter_tip(self.shared.chain, self.shared.filter_type, *position);
        debug!(chain = %self.shared.chain, %position, "cfilter tip updated");
    }

    fn trigger_state_machine(&self) {
        self.shared
            .state_machine_requested
            .store(true, Ordering::SeqCst);
    }
}

/// Builds cfilters locally from full blocks.
pub struct IndexerSink<S, H> {
    pub(crate) shared: Arc<OracleShared<S, H>>,
}

impl<S: FilterStore + Send + Sync + 'static, H: HeaderOracle> DownloadSink for IndexerSink<S, H> {
    type Download = bitcoin::Block;
    type Finished = Buf32;
    type Extra = FilterType;

    fn batch_size(&self, unallocated: usize) -> usize {
        unallocated.min(MAX_BATCH)
    }

    fn batch_ready(&self) {
        self.shared.header_batch_ready.store(true, Ordering::SeqCst);
    }

    fn queue_processing(&self, tasks: Vec<Arc<TaskOf<Self>>>) {
        for task in tasks {
            let position = *task.position();

            let previous = match task.previous().get() {
                Ok(header) => header,
                Err(err) => {
                    task.process(Err(err));
                    continue;
                }
            };
            let block = match task.data().try_get() {
                Some(Ok(block)) => block,
                _ => {
                    task.redownload();
                    continue;
                }
            };

            let block_hash: Buf32 = block.block_hash().into();
            if block_hash != *position.hash() {
                debug!(%position, "block does not hash to its expected id, redownloading");
                task.redownload();
                continue;
            }

            let elements = filter_elements(&block, self.shared.filter_type);
            let gcs = match Gcs::for_block(self.shared.filter_type, &block_hash, &elements) {
                Ok(gcs) => gcs,
                Err(err) => {
                    warn!(%position, %err, "failed to build cfilter from block");
                    task.process(Err(DownloadError::Invalid(err.to_string())));
                    continue;
                }
            };
            let header = gcs.header(&previous);

            if !self.shared.verify_checkpoint(position.height(), &header) {
                let err = FilterError::CheckpointMismatch(position.height());
                task.process(Err(DownloadError::Invalid(err.to_string())));
                continue;
            }

            let stored = self
                .shared
                .store
                .store_filters(self.shared.filter_type, &[(block_hash, gcs)])
                .and_then(|()| {
                    self.shared
                        .store
                        .store_headers(self.shared.filter_type, &[(block_hash, header)])
                });
            if let Err(err) = stored {
                warn!(%position, %err, "failed to store built cfilter");
                task.process(Err(DownloadError::Missing(err.to_string())));
                continue;
            }

            task.process(Ok(header));
        }
    }

    fn update_tip(&self, position: &BlockPosition, _finished: &Buf32) {
        let result = self
            .shared
            .store
            .set_header_tip(self.shared.filter_type, position)
            .and_then(|()| {
                self.shared
                    .store
                    .set_filter_tip(self.shared.filter_type, position)
            });
        if let Err(err) = result {
            warn!(%position, %err, "failed to persist built filter tip");
        }
        self.shared
            .status
            .publish_filter_tip(self.shared.chain, self.shared.filter_type, *position);
    }

    fn trigger_state_machine(&self) {
        self.shared
            .state_machine_requested
            .store(true, Ordering::SeqCst);
    }
}
