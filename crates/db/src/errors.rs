use thiserror::Error;

use cinder_primitives::prelude::*;

/// Simple result type used across the database interface.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("tried to insert into {0} out-of-order index {1}")]
    OooInsert(&'static str, i64),

    #[error("unknown subchain {0:?}")]
    UnknownSubchain(SubchainIndex),

    #[error("unknown output {0}")]
    UnknownOutput(Outpoint),

    #[error("invalid output state transition {0:?} -> {1:?}")]
    InvalidStateTransition(crate::types::TxoState, crate::types::TxoState),

    #[error("unknown proposal {0}")]
    UnknownProposal(Buf32),

    #[error("not yet bootstrapped")]
    NotBootstrapped,

    #[error("codec: {0}")]
    Codec(String),

    #[error("backend: {0}")]
    Backend(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<anyhow::Error> for DbError {
    fn from(value: anyhow::Error) -> Self {
        Self::Backend(value.to_string())
    }
}
