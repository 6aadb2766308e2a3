//! Shard fan-out: the per-shard execution interface, the concurrent
//! dispatcher, and an in-memory cluster that implements it.

pub mod dispatcher;
pub mod in_memory;
pub mod shard;

pub use dispatcher::{DispatchAttempt, Dispatcher, Outcome, RoundResult};
pub use in_memory::{ClusterEvent, DispatchKind, DispatchRecord, DispatchResult, InMemoryShardCluster};
pub use shard::{CursorBatch, CursorHandle, ShardError, ShardExecutor, ShardRequest};
