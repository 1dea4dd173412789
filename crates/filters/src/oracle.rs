use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use cinder_db::traits::FilterStore;
use cinder_download::{Batch, DownloadManager, Shared};
use cinder_gcs::{Gcs, GcsKey};
use cinder_primitives::prelude::*;
use cinder_status::StatusPublisher;

use crate::checkpoints::{filter_checkpoints, CheckpointMap};
use crate::sinks::{FilterSink, HeaderSink, IndexerSink, OracleShared};
use crate::traits::HeaderOracle;

/// How the oracle obtains filters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterMode {
    /// Download cfheaders and cfilters from peers.
    Download,
    /// Compute both locally from full blocks.
    BuildFromBlocks,
}

#[derive(Clone, Debug)]
pub struct FilterOracleConfig {
    pub chain: Chain,
    pub filter_type: FilterType,
    pub mode: FilterMode,
    /// Buffer bound per download pipeline; zero means unbounded.
    pub max_queue: usize,
    /// Checkpoint override, primarily for tests.  `None` uses the
    /// consensus table for the chain.
    pub checkpoints: Option<CheckpointMap>,
}

impl FilterOracleConfig {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            filter_type: chain.default_filter_type(),
            mode: FilterMode::Download,
            max_queue: 0,
            checkpoints: None,
        }
    }
}

/// Maintains the cfheader/cfilter chains for one (chain, filter type).
pub struct FilterOracle<S, H> {
    shared: Arc<OracleShared<S, H>>,
    mode: FilterMode,
    header_dl: Option<DownloadManager<HeaderSink<S, H>>>,
    filter_dl: Option<DownloadManager<FilterSink<S, H>>>,
    indexer_dl: Option<DownloadManager<IndexerSink<S, H>>>,
}

impl<S, H> FilterOracle<S, H>
where
    S: FilterStore + Send + Sync + 'static,
    H: HeaderOracle,
{
    pub fn new(
        config: FilterOracleConfig,
        store: Arc<S>,
        headers: Arc<H>,
        status: Arc<StatusPublisher>,
    ) -> Self {
        let checkpoints = config
            .checkpoints
            .clone()
            .unwrap_or_else(|| filter_checkpoints(config.chain).clone());

        let shared = Arc::new(OracleShared {
            chain: config.chain,
            filter_type: config.filter_type,
            store,
            headers,
            status,
            checkpoints,
            pending_reset: Mutex::new(None),
            state_machine_requested: Default::default(),
            header_batch_ready: Default::default(),
            filter_batch_ready: Default::default(),
        });

        let (anchor, previous) = reconcile_startup(&shared);
        info!(
            chain = %shared.chain,
            filter_type = ?shared.filter_type,
            %anchor,
            "filter oracle starting"
        );

        let mut oracle = Self {
            shared: shared.clone(),
            mode: config.mode,
            header_dl: None,
            filter_dl: None,
            indexer_dl: None,
        };

        match config.mode {
            FilterMode::Download => {
                oracle.header_dl = Some(DownloadManager::new(
                    HeaderSink {
                        shared: shared.clone(),
                    },
                    anchor,
                    Shared::ready(previous),
                    "cfheader",
                    config.max_queue,
                ));

                let filter_anchor = shared
                    .store
                    .filter_tip(shared.filter_type)
                    .ok()
                    .flatten()
                    .filter(|tip| tip.height() <= anchor.height())
                    .unwrap_or(anchor);
                oracle.filter_dl = Some(DownloadManager::new(
                    FilterSink {
                        shared: shared.clone(),
                    },
                    filter_anchor,
                    Shared::ready(empty_filter(&shared, &filter_anchor)),
                    "cfilter",
                    config.max_queue,
                ));
            }
            FilterMode::BuildFromBlocks => {
                oracle.indexer_dl = Some(DownloadManager::new(
                    IndexerSink { shared },
                    anchor,
                    Shared::ready(previous),
                    "cfilter index",
                    config.max_queue,
                ));
            }
        }

        oracle
    }

    pub fn chain(&self) -> Chain {
        self.shared.chain
    }

    pub fn filter_type(&self) -> FilterType {
        self.shared.filter_type
    }

    /// Best position with a committed cfheader.
    pub fn header_tip(&self) -> BlockPosition {
        match self.mode {
            FilterMode::Download => self.header_dl.as_ref().expect("oracle: header dl").done(),
            FilterMode::BuildFromBlocks => {
                self.indexer_dl.as_ref().expect("oracle: indexer dl").done()
            }
        }
    }

    /// Best position with a committed cfilter.
    pub fn filter_tip(&self) -> BlockPosition {
        match self.mode {
            FilterMode::Download => self.filter_dl.as_ref().expect("oracle: filter dl").done(),
            FilterMode::BuildFromBlocks => {
                self.indexer_dl.as_ref().expect("oracle: indexer dl").done()
            }
        }
    }

    /// Loads a stored cfilter.
    pub fn load_filter(&self, block: &Buf32) -> Option<Gcs> {
        self.shared
            .store
            .load_filter(self.shared.filter_type, block)
            .ok()
            .flatten()
    }

    /// Loads a stored cfheader.
    pub fn load_header(&self, block: &Buf32) -> Option<Buf32> {
        self.shared
            .store
            .load_header(self.shared.filter_type, block)
            .ok()
            .flatten()
    }

    /// Extends the pipelines with newly announced best-chain positions.
    ///
    /// A start at or below the current known position is a reorg; the
    /// anchor for the surviving prefix is resolved from storage.
    pub fn add_positions(&self, positions: Vec<BlockPosition>) {
        if positions.is_empty() {
            return;
        }

        let ft = self.shared.filter_type;
        match self.mode {
            FilterMode::Download => {
                let manager = self.header_dl.as_ref().expect("oracle: header dl");
                let prior = self.reorg_prior(manager.known(), &positions[0]);
                let reorged = prior.as_ref().map(|(ancestor, _)| *ancestor);
                manager.update_position(positions, ft, prior);

                // A truncated header chain invalidates any cfilter
                // positions above the ancestor; rebase that pipeline so
                // it follows the replacement headers.
                if let (Some(ancestor), Some(filter_dl)) = (reorged, &self.filter_dl) {
                    if filter_dl.known().height() > ancestor.height() {
                        let anchor = if filter_dl.done().height() <= ancestor.height() {
                            filter_dl.done()
                        } else {
                            ancestor
                        };
                        filter_dl
                            .reset(anchor, Shared::ready(empty_filter(&self.shared, &anchor)));
                    }
                }
            }
            FilterMode::BuildFromBlocks => {
                let manager = self.indexer_dl.as_ref().expect("oracle: indexer dl");
                let prior = self.reorg_prior(manager.known(), &positions[0]);
                manager.update_position(positions, ft, prior);
            }
        }
    }

    /// Rebases every pipeline onto a reorg ancestor.  Used when the
    /// reorg is deeper than the buffered window.
    pub fn handle_reorg(&self, ancestor: &BlockPosition) {
        info!(chain = %self.shared.chain, %ancestor, "filter oracle handling reorg");
        self.reset_all(*ancestor);
    }

    /// Drives the pipelines forward: applies pending resets, runs the
    /// state machines, and keeps the filter pipeline chasing the header
    /// pipeline.  Returns whether any state advanced.
    pub fn heartbeat(&self) -> bool {
        if let Some(height) = self.shared.pending_reset.lock().take() {
            let anchor = self.checkpoint_anchor(height);
            warn!(
                chain = %self.shared.chain,
                failed = %height,
                %anchor,
                "rolling back to checkpoint anchor"
            );
            self.reset_all(anchor);
        }

        self.shared
            .state_machine_requested
            .store(false, Ordering::SeqCst);

        let mut advanced = false;
        if let Some(manager) = &self.header_dl {
            advanced |= manager.state_machine();
        }
        if let Some(manager) = &self.indexer_dl {
            advanced |= manager.state_machine();
        }

        self.feed_filters();
        if let Some(manager) = &self.filter_dl {
            advanced |= manager.state_machine();
        }

        advanced
    }

    /// Whether a state machine tick was requested since the last
    /// heartbeat.
    pub fn needs_heartbeat(&self) -> bool {
        self.shared.state_machine_requested.load(Ordering::SeqCst)
    }

    /// Allocates downloadable cfheader work, when in download mode.
    pub fn allocate_header_batch(&self) -> Option<Batch<HeaderSink<S, H>>> {
        self.shared.header_batch_ready.store(false, Ordering::SeqCst);
        let batch = self.header_dl.as_ref()?.allocate_batch(self.shared.filter_type);
        (!batch.is_empty()).then_some(batch)
    }

    /// Allocates downloadable cfilter work, when in download mode.
    pub fn allocate_filter_batch(&self) -> Option<Batch<FilterSink<S, H>>> {
        self.shared.filter_batch_ready.store(false, Ordering::SeqCst);
        let batch = self.filter_dl.as_ref()?.allocate_batch(self.shared.filter_type);
        (!batch.is_empty()).then_some(batch)
    }

    /// Allocates block-indexing work, when building filters locally.
    pub fn allocate_index_batch(&self) -> Option<Batch<IndexerSink<S, H>>> {
        self.shared.header_batch_ready.store(false, Ordering::SeqCst);
        let batch = self
            .indexer_dl
            .as_ref()?
            .allocate_batch(self.shared.filter_type);
        (!batch.is_empty()).then_some(batch)
    }

    /// Anchor for an `update_position` call that truncates history: the
    /// best-chain parent of the new start, with its stored header.
    fn reorg_prior(
        &self,
        known: BlockPosition,
        start: &BlockPosition,
    ) -> Option<(BlockPosition, Shared<Buf32>)> {
        if known.height() < start.height() {
            return None;
        }

        let parent_height = start.height() - 1;
        if parent_height < 0 {
            return Some((BlockPosition::blank(), Shared::ready(Buf32::zero())));
        }

        let parent = self.shared.headers.position_at(parent_height)?;
        let header = self
            .shared
            .store
            .load_header(self.shared.filter_type, parent.hash())
            .ok()
            .flatten()?;
        Some((parent, Shared::ready(header)))
    }

    /// Keeps the cfilter pipeline extended up to the committed cfheader
    /// tip.
    fn feed_filters(&self) {
        let (Some(header_dl), Some(filter_dl)) = (&self.header_dl, &self.filter_dl) else {
            return;
        };

        let target = header_dl.done();
        let known = filter_dl.known();
        if target.height() <= known.height() {
            return;
        }

        let span = (target.height() - known.height()) as usize;
        let positions: Vec<_> = self
            .shared
            .headers
            .best_chain(&known, span)
            .into_iter()
            .filter(|p| p.height() <= target.height())
            .collect();
        if positions.is_empty() {
            return;
        }

        filter_dl.update_position(positions, self.shared.filter_type, None);
    }

    /// The highest checkpoint below `failed` whose stored header still
    /// matches, or the blank position when none does.
    fn checkpoint_anchor(&self, failed: Height) -> BlockPosition {
        for (&height, entries) in self.shared.checkpoints.range(..failed).rev() {
            let Some((_, expected)) = entries
                .iter()
                .find(|(ft, _)| *ft == self.shared.filter_type)
            else {
                continue;
            };
            let Some(hash) = self.shared.headers.best_hash(height) else {
                continue;
            };
            let stored = self
                .shared
                .store
                .load_header(self.shared.filter_type, &hash)
                .ok()
                .flatten();
            if stored == Some(*expected) {
                return BlockPosition::new(height, hash);
            }
        }

        BlockPosition::blank()
    }

    fn reset_all(&self, anchor: BlockPosition) {
        let previous = self.stored_header_at(&anchor);

        if let Some(manager) = &self.header_dl {
            manager.reset(anchor, Shared::ready(previous));
        }
        if let Some(manager) = &self.indexer_dl {
            manager.reset(anchor, Shared::ready(previous));
        }
        if let Some(manager) = &self.filter_dl {
            manager.reset(anchor, Shared::ready(empty_filter(&self.shared, &anchor)));
        }
    }

    fn stored_header_at(&self, position: &BlockPosition) -> Buf32 {
        if position.is_blank() {
            return Buf32::zero();
        }
        self.shared
            .store
            .load_header(self.shared.filter_type, position.hash())
            .ok()
            .flatten()
            .unwrap_or_else(Buf32::zero)
    }
}

/// Placeholder finished value used to seed the cfilter pipeline; the
/// filter chain does not consume its predecessor's output.
fn empty_filter<S, H>(shared: &OracleShared<S, H>, anchor: &BlockPosition) -> Gcs {
    Gcs::build(
        shared.filter_type,
        GcsKey::from_block_hash(anchor.hash()),
        Vec::<Vec<u8>>::new(),
    )
    .expect("oracle: empty filter")
}

/// Startup reconciliation: rebases the persisted header tip onto the
/// best chain, then walks the checkpoint table downwards until a
/// checkpoint agrees with stored data.  Returns the anchor position and
/// the cfheader to chain the next task onto.
fn reconcile_startup<S, H>(shared: &OracleShared<S, H>) -> (BlockPosition, Buf32)
where
    S: FilterStore,
    H: HeaderOracle,
{
    let ft = shared.filter_type;
    let mut tip = shared
        .store
        .header_tip(ft)
        .ok()
        .flatten()
        .unwrap_or_else(BlockPosition::blank);

    if !tip.is_blank() && !shared.headers.is_in_best_chain(&tip) {
        let parent = shared.headers.common_parent(&tip);
        debug!(%tip, %parent, "persisted filter tip is on a sibling chain");
        tip = parent;
    }

    // Walk checkpoints downward from the tip; the first one whose
    // stored header matches anchors the chain, anything above a
    // mismatch is rewound.
    for (&height, entries) in shared.checkpoints.range(..=tip.height()).rev() {
        let Some((_, expected)) = entries.iter().find(|(t, _)| *t == ft) else {
            continue;
        };
        let Some(hash) = shared.headers.best_hash(height) else {
            continue;
        };
        let stored = shared.store.load_header(ft, &hash).ok().flatten();

        if stored == Some(*expected) {
            break;
        }

        warn!(%height, "stored cfheader disagrees with checkpoint, rewinding");
        tip = if height > 0 {
            shared
                .headers
                .position_at(height - 1)
                .unwrap_or_else(BlockPosition::blank)
        } else {
            BlockPosition::blank()
        };
    }

    let previous = if tip.is_blank() {
        Buf32::zero()
    } else {
        shared
            .store
            .load_header(ft, tip.hash())
            .ok()
            .flatten()
            .unwrap_or_else(Buf32::zero)
    };

    (tip, previous)
}
