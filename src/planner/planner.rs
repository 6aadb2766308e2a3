use std::collections::BTreeSet;

use tracing::trace;

use super::dispatch_plan::*;
use crate::core::{Result, RouterError, ShardId};
use crate::pipeline::{MergeLocation, Pipeline, PipelineSplitter};

/// Dispatch planner - combines target shards with the pipeline split
///
/// Plan shape is a pure function of `(targets, pipeline, primary)`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPlanner {
    merge_on_router: bool,
}

impl DispatchPlanner {
    pub fn new(merge_on_router: bool) -> Self {
        Self { merge_on_router }
    }

    pub fn plan(
        &self,
        targets: &BTreeSet<ShardId>,
        pipeline: &Pipeline,
        primary: &ShardId,
    ) -> Result<DispatchPlan> {
        let Some(first) = targets.first() else {
            return Err(RouterError::PlanningError("no target shards".into()));
        };
        let split = PipelineSplitter::split(pipeline)?;

        // A single data source needs no merge, unless output must land on a
        // primary that does not hold the data.
        if targets.len() == 1
            && (split.merge_location != MergeLocation::PrimaryShard || first == primary)
        {
            trace!(shard = %first, "planned passthrough");
            return Ok(DispatchPlan::Passthrough {
                shard: first.clone(),
                pipeline: pipeline.clone(),
            });
        }

        let (merge_location, merge_host) = if split.merge_pipeline.is_empty() {
            (MergeLocation::Router, MergeHost::Router)
        } else {
            match split.merge_location {
                MergeLocation::PrimaryShard => {
                    (MergeLocation::PrimaryShard, MergeHost::Shard(primary.clone()))
                }
                _ if self.merge_on_router => (MergeLocation::Router, MergeHost::Router),
                _ => (MergeLocation::AnyShard, MergeHost::Shard(first.clone())),
            }
        };

        trace!(shards = targets.len(), ?merge_location, "planned split dispatch");
        Ok(DispatchPlan::Split(SplitPlan {
            shards: targets.clone(),
            shard_pipeline: split.shard_pipeline,
            merge_pipeline: split.merge_pipeline,
            merge_location,
            merge_host,
        }))
    }
}

impl Default for DispatchPlanner {
    fn default() -> Self {
        Self::new(true)
    }
}
