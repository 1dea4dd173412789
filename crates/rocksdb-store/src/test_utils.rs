//! Helpers for tests that need a throwaway store.

use std::sync::Arc;

use rockbound::DB;

use cinder_primitives::params::Chain;

use crate::WalletDb;

/// Opens a store in a temp directory that outlives the test process.
pub fn temp_db() -> Arc<DB> {
    let dir = tempfile::TempDir::new().expect("test: create temp dir");
    crate::open_rocksdb(&dir.into_path()).expect("test: open rocksdb")
}

pub fn temp_wallet_db() -> WalletDb {
    WalletDb::new(temp_db(), Chain::UnitTest)
}
