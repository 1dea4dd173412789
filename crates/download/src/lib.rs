//! Generic pipelined download manager.
//!
//! Work is modeled as a run of [`Task`]s over consecutive block
//! positions, each moving through download and processing stages.  A
//! [`DownloadManager`] owns the run, hands out contiguous [`Batch`]es to
//! download workers, and commits the tip forward as the processed prefix
//! grows.  The component consuming the pipeline supplies a
//! [`DownloadSink`] describing batch sizing, processing hand-off, and
//! tip persistence.

mod batch;
mod manager;
mod promise;
mod task;

pub use batch::Batch;
pub use manager::{DownloadManager, DownloadSink, Previous, TaskOf};
pub use promise::Shared;
pub use task::{Task, TaskState};

use thiserror::Error;

/// Failure modes observed through a task's shared output handles.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("payload unavailable: {0}")]
    Missing(String),

    #[error("payload failed validation: {0}")]
    Invalid(String),

    #[error("download pipeline shut down")]
    Cancelled,
}
