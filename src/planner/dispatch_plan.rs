use std::collections::BTreeSet;
use std::fmt;

use crate::core::ShardId;
use crate::pipeline::{MergeLocation, Pipeline};

/// Dispatch strategy for one round of a request.
///
/// Built fresh every round from the original pipeline; never patched.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchPlan {
    /// The whole, unsplit pipeline goes to one shard; nothing is merged.
    Passthrough { shard: ShardId, pipeline: Pipeline },
    Split(SplitPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    pub shards: BTreeSet<ShardId>,
    pub shard_pipeline: Pipeline,
    pub merge_pipeline: Pipeline,
    pub merge_location: MergeLocation,
    pub merge_host: MergeHost,
}

/// Resolved executor of a split plan's merge half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeHost {
    Router,
    Shard(ShardId),
}

/// Structural summary of a plan, carried across retry rounds for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanShape {
    Passthrough,
    Split { shards: usize },
}

impl fmt::Display for PlanShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough => f.write_str("passthrough"),
            Self::Split { shards } => write!(f, "split({} shards)", shards),
        }
    }
}

impl DispatchPlan {
    pub fn shape(&self) -> PlanShape {
        match self {
            Self::Passthrough { .. } => PlanShape::Passthrough,
            Self::Split(split) => PlanShape::Split {
                shards: split.shards.len(),
            },
        }
    }

    pub fn target_shards(&self) -> BTreeSet<ShardId> {
        match self {
            Self::Passthrough { shard, .. } => BTreeSet::from([shard.clone()]),
            Self::Split(split) => split.shards.clone(),
        }
    }

    /// `(shard, pipeline)` pairs sent in the dispatch phase.
    pub fn shard_requests(&self) -> Vec<(ShardId, Pipeline)> {
        match self {
            Self::Passthrough { shard, pipeline } => vec![(shard.clone(), pipeline.clone())],
            Self::Split(split) => split
                .shards
                .iter()
                .map(|shard| (shard.clone(), split.shard_pipeline.clone()))
                .collect(),
        }
    }

    /// Whether any part of this plan materializes output.
    pub fn writes(&self) -> bool {
        match self {
            Self::Passthrough { pipeline, .. } => pipeline.has_write_stage(),
            Self::Split(split) => split.merge_pipeline.has_write_stage(),
        }
    }
}
