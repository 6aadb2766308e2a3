//! Aggregation pipelines: parsing, the shard/merge split, and local execution.

pub mod exec;
pub mod filter;
pub mod group;
pub mod splitter;
pub mod stage;

pub use exec::{ExecContext, NoOutput, OutputSink, apply_merge, run_pipeline};
pub use splitter::{MergeLocation, PipelineSplitter, SplitResult};
pub use stage::{
    Accumulator, AccumulatorSpec, GroupSpec, MergeSpec, OutputTarget, Pipeline, ProjectSpec,
    SortDirection, SortSpec, Stage, StageKind, UnwindSpec, WhenMatched, WhenNotMatched,
};
