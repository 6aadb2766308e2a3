// ============================================================================
// shardagg Library
// ============================================================================

pub mod core;
pub mod date;
pub mod dispatch;
pub mod evaluator;
pub mod merge;
pub mod pipeline;
pub mod planner;
pub mod router;
pub mod routing;

// Re-export main types for convenience
pub use core::{Deadline, Document, Epoch, Namespace, Result, RouterError, ShardId};
pub use date::{DateParseError, parse_date_string, parse_date_with_format};
pub use dispatch::{InMemoryShardCluster, ShardExecutor};
pub use merge::ResultStream;
pub use pipeline::{Pipeline, PipelineSplitter};
pub use planner::{DispatchPlan, DispatchPlanner};
pub use router::{AggregateOptions, Router, RouterConfig};
pub use routing::{InMemoryMetadataAuthority, MetadataAuthority, RoutingTableCache, ShardSetResolver};
