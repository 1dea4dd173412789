//! Filter oracle pipeline tests over a real store.

use std::sync::Arc;

use parking_lot::Mutex;

use cinder_db::traits::FilterStore;
use cinder_filters::checkpoints::CheckpointMap;
use cinder_filters::{FilterMode, FilterOracle, FilterOracleConfig, HeaderOracle};
use cinder_gcs::{Gcs, GcsKey};
use cinder_primitives::hash;
use cinder_primitives::prelude::*;
use cinder_rocksdb::{test_utils::temp_db, FilterDb};
use cinder_status::{StatusPublisher, WalletEvent};

struct MockHeaders {
    chain: Mutex<Vec<BlockPosition>>,
}

impl MockHeaders {
    fn new(len: usize) -> Self {
        let chain = (0..len as i64)
            .map(|height| {
                let mut hash = [0u8; 32];
                hash[..8].copy_from_slice(&height.to_le_bytes());
                hash[31] = 0xb1;
                BlockPosition::new(height, Buf32::from(hash))
            })
            .collect();
        Self {
            chain: Mutex::new(chain),
        }
    }

    fn positions(&self) -> Vec<BlockPosition> {
        self.chain.lock().clone()
    }
}

impl HeaderOracle for MockHeaders {
    fn best_position(&self) -> BlockPosition {
        *self.chain.lock().last().expect("mock: non-empty chain")
    }

    fn best_hash(&self, height: Height) -> Option<Buf32> {
        if height < 0 {
            return None;
        }
        self.chain.lock().get(height as usize).map(|p| *p.hash())
    }

    fn best_chain(&self, from: &BlockPosition, limit: usize) -> Vec<BlockPosition> {
        self.chain
            .lock()
            .iter()
            .filter(|p| p.height() > from.height())
            .take(limit)
            .copied()
            .collect()
    }

    fn common_parent(&self, position: &BlockPosition) -> BlockPosition {
        let chain = self.chain.lock();
        let height = position.height().clamp(0, chain.len() as i64 - 1);
        if chain[height as usize].hash() == position.hash() {
            return chain[height as usize];
        }
        chain[(height as usize).saturating_sub(1)]
    }

    fn genesis_position(&self) -> BlockPosition {
        self.chain.lock()[0]
    }
}

/// Per-block element sets and the filters a peer would serve.
fn make_filters(positions: &[BlockPosition]) -> Vec<Gcs> {
    positions
        .iter()
        .map(|position| {
            let elements: Vec<Vec<u8>> = (0..5u8)
                .map(|i| vec![position.height() as u8, i, 0x77])
                .collect();
            Gcs::for_block(FilterType::Basic, position.hash(), &elements).unwrap()
        })
        .collect()
}

fn oracle_config(checkpoints: CheckpointMap) -> FilterOracleConfig {
    FilterOracleConfig {
        chain: Chain::UnitTest,
        filter_type: FilterType::Basic,
        mode: FilterMode::Download,
        max_queue: 0,
        checkpoints: Some(checkpoints),
    }
}

fn drive(oracle: &FilterOracle<FilterDb, MockHeaders>) {
    for _ in 0..10 {
        if !oracle.heartbeat() {
            break;
        }
    }
}

#[test]
fn test_download_pipeline_commits_header_and_filter_chain() {
    let headers = Arc::new(MockHeaders::new(5));
    let store = Arc::new(FilterDb::new(temp_db()));
    let status = Arc::new(StatusPublisher::new());
    let mut events = status.subscribe();

    let oracle = FilterOracle::new(
        oracle_config(CheckpointMap::new()),
        store.clone(),
        headers.clone(),
        status,
    );

    let positions = headers.positions();
    let filters = make_filters(&positions);

    oracle.add_positions(positions.clone());
    oracle.heartbeat();

    // Serve the cfilter hashes.
    let batch = oracle.allocate_header_batch().expect("header work");
    assert_eq!(batch.len(), 5);
    for (position, filter) in positions.iter().zip(&filters) {
        assert!(batch.download(position, filter.filter_hash(), None));
    }
    drop(batch);
    drive(&oracle);

    assert_eq!(oracle.header_tip(), positions[4]);

    // The committed headers chain correctly from the zero seed.
    let mut expect = Buf32::zero();
    for (position, filter) in positions.iter().zip(&filters) {
        expect = hash::sha256d_pair(&filter.filter_hash(), &expect);
        assert_eq!(oracle.load_header(position.hash()), Some(expect));
    }

    // Serve the cfilters themselves.
    let batch = oracle.allocate_filter_batch().expect("filter work");
    assert_eq!(batch.len(), 5);
    for (position, filter) in positions.iter().zip(&filters) {
        assert!(batch.download(position, filter.encoded(), None));
    }
    drop(batch);
    drive(&oracle);

    assert_eq!(oracle.filter_tip(), positions[4]);
    let restored = oracle.load_filter(positions[2].hash()).expect("filter");
    assert_eq!(restored, filters[2]);

    // The tip announcement went out once, for the final position.
    let mut tips = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WalletEvent::FilterTip { tip, .. } = event {
            tips.push(tip);
        }
    }
    assert_eq!(tips.last(), Some(&positions[4]));

    // The store can satisfy a later run: a fresh oracle starts at the
    // committed tip.
    let status = Arc::new(StatusPublisher::new());
    let restarted = FilterOracle::new(
        oracle_config(CheckpointMap::new()),
        store,
        headers,
        status,
    );
    assert_eq!(restarted.header_tip(), positions[4]);
}

#[test]
fn test_checkpoint_mismatch_resets_pipelines() {
    let headers = Arc::new(MockHeaders::new(4));
    let store = Arc::new(FilterDb::new(temp_db()));
    let status = Arc::new(StatusPublisher::new());

    // Demand an impossible cfheader at height 2.
    let mut checkpoints = CheckpointMap::new();
    checkpoints.insert(2, vec![(FilterType::Basic, Buf32::from([0xde; 32]))]);

    let oracle = FilterOracle::new(oracle_config(checkpoints), store, headers.clone(), status);

    let positions = headers.positions();
    let filters = make_filters(&positions);

    oracle.add_positions(positions.clone());
    oracle.heartbeat();

    let batch = oracle.allocate_header_batch().expect("header work");
    for (position, filter) in positions.iter().zip(&filters) {
        assert!(batch.download(position, filter.filter_hash(), None));
    }
    drop(batch);

    // Processing trips the checkpoint; the next heartbeat rolls both
    // pipelines back to the blank anchor, dropping buffered work.
    drive(&oracle);

    assert!(oracle.header_tip().is_blank());
    assert!(oracle.filter_tip().is_blank());
    assert!(oracle.allocate_header_batch().is_none());

    // The chain can restart from scratch.
    oracle.add_positions(positions.clone());
    oracle.heartbeat();
    let batch = oracle.allocate_header_batch().expect("restarted work");
    assert_eq!(batch.tasks()[0].position(), &positions[0]);
}

#[test]
fn test_restart_rewinds_when_checkpoint_disagrees_with_store() {
    let headers = Arc::new(MockHeaders::new(3));
    let store = Arc::new(FilterDb::new(temp_db()));
    let status = Arc::new(StatusPublisher::new());

    // Pretend an earlier run committed garbage headers through height 2.
    let positions = headers.positions();
    let bogus: Vec<(Buf32, Buf32)> = positions
        .iter()
        .map(|p| (*p.hash(), Buf32::from([0x66; 32])))
        .collect();
    store.store_headers(FilterType::Basic, &bogus).unwrap();
    store
        .set_header_tip(FilterType::Basic, &positions[2])
        .unwrap();

    let mut checkpoints = CheckpointMap::new();
    checkpoints.insert(1, vec![(FilterType::Basic, Buf32::from([0x11; 32]))]);

    let oracle = FilterOracle::new(oracle_config(checkpoints), store, headers, status);

    // The stored header at height 1 disagrees with the checkpoint, so
    // startup rewinds the tip below it.
    assert_eq!(oracle.header_tip().height(), 0);
}

#[test]
fn test_filter_prefetch_from_store() {
    let headers = Arc::new(MockHeaders::new(3));
    let store = Arc::new(FilterDb::new(temp_db()));
    let status = Arc::new(StatusPublisher::new());

    let positions = headers.positions();
    let filters = make_filters(&positions);

    // Filters (but not headers) are already on disk.
    let stored: Vec<(Buf32, Gcs)> = positions
        .iter()
        .zip(&filters)
        .map(|(p, f)| (*p.hash(), f.clone()))
        .collect();
    store.store_filters(FilterType::Basic, &stored).unwrap();

    let oracle = FilterOracle::new(
        oracle_config(CheckpointMap::new()),
        store,
        headers,
        status,
    );

    oracle.add_positions(positions.clone());
    oracle.heartbeat();
    let batch = oracle.allocate_header_batch().expect("header work");
    for (position, filter) in positions.iter().zip(&filters) {
        assert!(batch.download(position, filter.filter_hash(), None));
    }
    drop(batch);
    drive(&oracle);

    // The filter pipeline pre-resolves every task from storage; no
    // batch is ever offered and the tip still advances.
    assert!(oracle.allocate_filter_batch().is_none());
    assert_eq!(oracle.filter_tip(), positions[2]);
}

#[test]
fn test_filters_keyed_by_block_hash() {
    let position = BlockPosition::new(7, Buf32::from([0x42; 32]));
    let gcs = Gcs::for_block(FilterType::Basic, position.hash(), [b"x".to_vec()]).unwrap();
    let direct = Gcs::build(
        FilterType::Basic,
        GcsKey::from_block_hash(position.hash()),
        [b"x".to_vec()],
    )
    .unwrap();
    assert_eq!(gcs, direct);
}
