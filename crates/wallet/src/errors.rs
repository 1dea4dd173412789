use thiserror::Error;

pub type WalletResult<T> = Result<T, WalletError>;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("db: {0}")]
    Db(#[from] cinder_db::DbError),

    #[error("download: {0}")]
    Download(#[from] cinder_download::DownloadError),

    #[error("filter: {0}")]
    Filter(#[from] cinder_gcs::GcsError),

    #[error("spend: {0}")]
    Spend(#[from] crate::spend::BuilderError),

    #[error("block {0} does not hash to its expected id")]
    BlockIdMismatch(cinder_primitives::block::BlockPosition),

    #[error("key {0:?} is not derivable")]
    UnknownKey(cinder_primitives::keys::KeyId),

    #[error("reorg aborted after {0} errors")]
    ReorgAborted(i32),

    #[error("wallet is shutting down")]
    ShuttingDown,
}
