use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CrdtError;
use crate::proto::endpoint::RpcError;
use crate::proto::frame::FrameError;
use crate::scout::CommitLogError;
use crate::scout::TxnError;

/// Crate-level convenience error: a thin wrapper over the subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScoutError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    CommitLog(#[from] CommitLogError),
}

impl ScoutError {
    /// Whether retrying the failed operation may succeed without changing
    /// inputs or state.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScoutError::Rpc(err) => err.is_timeout(),
            ScoutError::Txn(TxnError::Network { .. }) => true,
            ScoutError::Txn(TxnError::VersionNotFound { .. }) => true,
            _ => false,
        }
    }
}
