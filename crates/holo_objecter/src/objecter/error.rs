//! Terminal outcomes a caller can observe for a request.

use super::types::{Epoch, PoolId};

/// Error delivered to request continuations.
///
/// Cloneable so a single failure can complete both the ack and the commit
/// continuation of one request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ObjecterError {
    #[error("target pool {pool} was removed")]
    TargetPoolRemoved { pool: PoolId },

    /// Only reported to callers awaiting a cancelled request through a
    /// channel; callback continuations are never invoked on cancellation.
    #[error("request was cancelled")]
    Cancelled,

    #[error("no map placed the request before its deadline (last epoch {epoch})")]
    MapTimeout { epoch: Epoch },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("inflight budget exhausted ({bytes} bytes, {ops} ops outstanding)")]
    BudgetExceeded { bytes: u64, ops: u64 },

    #[error("storage returned error code {code}")]
    Remote { code: i32 },

    #[error("pool {name} already exists")]
    PoolExists { name: String },

    #[error("pool {pool} does not exist")]
    PoolNotFound { pool: String },

    #[error("no outstanding request with id {0}")]
    UnknownRequest(u64),

    #[error("request timed out")]
    OpTimeout,

    #[error("object router is shut down")]
    Shutdown,
}

impl ObjecterError {
    /// Short, stable label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ObjecterError::TargetPoolRemoved { .. } => "target_pool_removed",
            ObjecterError::Cancelled => "cancelled",
            ObjecterError::MapTimeout { .. } => "map_timeout",
            ObjecterError::TransportFailure(_) => "transport_failure",
            ObjecterError::BudgetExceeded { .. } => "budget_exceeded",
            ObjecterError::Remote { .. } => "remote",
            ObjecterError::PoolExists { .. } => "pool_exists",
            ObjecterError::PoolNotFound { .. } => "pool_not_found",
            ObjecterError::UnknownRequest(_) => "unknown_request",
            ObjecterError::OpTimeout => "op_timeout",
            ObjecterError::Shutdown => "shutdown",
        }
    }
}
