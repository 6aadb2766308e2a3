use std::time::Duration;

use thiserror::Error;

use super::types::{Epoch, Namespace, ShardId};
use crate::date::DateParseError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(Namespace),

    #[error("Invalid routing table: {0}")]
    InvalidRoutingTable(String),

    #[error("Stale routing info on shard '{shard}': router believed epoch {believed}, shard has {actual}")]
    StaleRouting {
        shard: ShardId,
        believed: Epoch,
        actual: Epoch,
    },

    #[error("Shard '{shard}' failed: {message}")]
    ShardExecution { shard: ShardId, message: String },

    #[error("Could not converge on routing table for '{namespace}' after {attempts} dispatch rounds")]
    RoutingConvergence { namespace: Namespace, attempts: u32 },

    #[error("Operation exceeded time limit of {0:?}")]
    Timeout(Duration),

    #[error("Cursor {0} not found")]
    CursorNotFound(u64),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error(transparent)]
    DateParse(#[from] DateParseError),

    #[error("Metadata authority unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl RouterError {
    /// True for the one error class the retry loop absorbs.
    pub fn is_stale_routing(&self) -> bool {
        matches!(self, Self::StaleRouting { .. })
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

impl<T> From<std::sync::PoisonError<T>> for RouterError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
