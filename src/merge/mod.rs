//! Consumption of shard cursors into the final result stream.

pub mod coordinator;
pub mod stream;

pub use coordinator::MergeCoordinator;
pub use stream::ResultStream;
