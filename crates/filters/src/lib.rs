//! The filter oracle: maintains the cfheader and cfilter chains for one
//! (chain, filter type) pair.
//!
//! Three download pipelines cooperate here.  The header pipeline
//! downloads cfilter hashes and chains them into cfheaders, verified
//! against the consensus checkpoint table.  The filter pipeline
//! downloads the cfilters themselves and verifies each against the
//! stored header chain.  When the node keeps full blocks locally, the
//! indexer pipeline computes both from block data instead.

pub mod checkpoints;
mod elements;
mod oracle;
mod sinks;
mod traits;

pub use elements::filter_elements;
pub use oracle::{FilterMode, FilterOracle, FilterOracleConfig};
pub use sinks::{FilterSink, HeaderSink, IndexerSink};
pub use traits::{BlockOracle, HeaderOracle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter decode failed: {0}")]
    Decode(#[from] cinder_gcs::GcsError),

    #[error("cfheader at height {0} does not match its checkpoint")]
    CheckpointMismatch(i64),

    #[error("cfilter does not verify against the stored header chain")]
    HeaderChainMismatch,

    #[error("db: {0}")]
    Db(#[from] cinder_db::DbError),
}
