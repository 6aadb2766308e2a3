use std::sync::Arc;

use super::stream::{PendingMerge, ResultStream};
use crate::core::{Deadline, Namespace};
use crate::dispatch::{CursorHandle, ShardExecutor};
use crate::planner::DispatchPlan;

/// Turns a successful round's cursors into the caller's result stream.
pub struct MergeCoordinator {
    executor: Arc<dyn ShardExecutor>,
    batch_size: usize,
}

impl MergeCoordinator {
    pub fn new(executor: Arc<dyn ShardExecutor>, batch_size: usize) -> Self {
        Self {
            executor,
            batch_size: batch_size.max(1),
        }
    }

    pub fn assemble(
        &self,
        namespace: &Namespace,
        plan: &DispatchPlan,
        cursors: Vec<CursorHandle>,
        deadline: Option<Deadline>,
    ) -> ResultStream {
        let executor = Arc::clone(&self.executor);
        match plan {
            DispatchPlan::Split(split) if !split.merge_pipeline.is_empty() => ResultStream::pending(
                executor,
                PendingMerge {
                    namespace: namespace.clone(),
                    pipeline: split.merge_pipeline.clone(),
                    host: split.merge_host.clone(),
                    cursors,
                },
                self.batch_size,
                deadline,
            ),
            // Passthrough, or a split with nothing to merge: stream the cursors.
            _ => ResultStream::from_cursors(executor, cursors, self.batch_size, deadline),
        }
    }
}
