use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{Document, Epoch, Namespace, Result, RouterError, ShardId};
use crate::pipeline::Pipeline;

/// Server-side cursor opened by a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorHandle {
    pub shard: ShardId,
    pub cursor_id: u64,
}

impl fmt::Display for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.shard, self.cursor_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CursorBatch {
    pub documents: Vec<Document>,
    /// The shard closed the cursor after this batch.
    pub exhausted: bool,
}

/// Failure reported by a shard for one request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardError {
    #[error("stale routing info: router sent epoch {believed}, shard has {actual}")]
    StaleRoutingInfo { believed: Epoch, actual: Epoch },

    #[error("{0}")]
    Execution(String),
}

impl ShardError {
    pub fn into_router_error(self, shard: &ShardId) -> RouterError {
        match self {
            Self::StaleRoutingInfo { believed, actual } => RouterError::StaleRouting {
                shard: shard.clone(),
                believed,
                actual,
            },
            Self::Execution(message) => RouterError::ShardExecution {
                shard: shard.clone(),
                message,
            },
        }
    }
}

impl From<RouterError> for ShardError {
    fn from(err: RouterError) -> Self {
        Self::Execution(err.to_string())
    }
}

/// A shard-local pipeline execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRequest {
    pub namespace: Namespace,
    pub pipeline: Pipeline,
    /// Epoch of the routing table the router planned with.
    pub believed_epoch: Epoch,
}

/// Per-shard execution interface consumed by the router.
///
/// Shards compare `believed_epoch` with their own metadata and answer
/// `StaleRoutingInfo` on disagreement; the router never inspects epochs itself.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    async fn execute_local_pipeline(
        &self,
        shard: &ShardId,
        request: ShardRequest,
    ) -> std::result::Result<CursorHandle, ShardError>;

    /// Runs a merge pipeline on `shard` over documents gathered from the
    /// participating shards.
    async fn execute_merge_pipeline(
        &self,
        shard: &ShardId,
        namespace: &Namespace,
        pipeline: Pipeline,
        input: Vec<Document>,
    ) -> std::result::Result<CursorHandle, ShardError>;

    async fn next_batch(&self, cursor: &CursorHandle, batch_size: usize) -> Result<CursorBatch>;

    /// Releases a cursor. Closing an unknown or exhausted cursor is a no-op.
    async fn close_cursor(&self, cursor: &CursorHandle) -> Result<()>;
}
