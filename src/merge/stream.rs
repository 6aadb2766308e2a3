use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use tracing::{debug, warn};

use crate::core::{Deadline, Document, Namespace, Result};
use crate::dispatch::{CursorHandle, ShardExecutor};
use crate::pipeline::{ExecContext, NoOutput, Pipeline, SortSpec, Stage, run_pipeline};
use crate::planner::MergeHost;

/// Merge half that has not run yet.
pub(crate) struct PendingMerge {
    pub namespace: Namespace,
    pub pipeline: Pipeline,
    pub host: MergeHost,
    pub cursors: Vec<CursorHandle>,
}

enum Source {
    /// Pull batches round-robin from these cursors.
    Cursors(VecDeque<CursorHandle>),
    Pending(PendingMerge),
    Done,
}

/// Lazily produced result documents of one aggregation.
///
/// Restartable only by re-running the aggregation. Dropping a stream
/// before exhaustion leaves server cursors open; call `close` instead.
pub struct ResultStream {
    executor: Arc<dyn ShardExecutor>,
    batch_size: usize,
    deadline: Option<Deadline>,
    buffer: VecDeque<Document>,
    source: Source,
}

impl ResultStream {
    pub(crate) fn from_cursors(
        executor: Arc<dyn ShardExecutor>,
        cursors: Vec<CursorHandle>,
        batch_size: usize,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            executor,
            batch_size,
            deadline,
            buffer: VecDeque::new(),
            source: Source::Cursors(cursors.into()),
        }
    }

    pub(crate) fn pending(
        executor: Arc<dyn ShardExecutor>,
        merge: PendingMerge,
        batch_size: usize,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            executor,
            batch_size,
            deadline,
            buffer: VecDeque::new(),
            source: Source::Pending(merge),
        }
    }

    pub async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if matches!(self.source, Source::Done) {
                return Ok(None);
            }
            if let Some(deadline) = self.deadline {
                if deadline.has_expired() {
                    self.close().await;
                    return Err(deadline.timeout_error());
                }
            }
            if let Err(err) = self.advance().await {
                self.close().await;
                return Err(err);
            }
        }
    }

    pub async fn try_collect(mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    /// Runs a pending merge now instead of on the first pull.
    pub async fn prime(&mut self) -> Result<()> {
        if matches!(self.source, Source::Pending(_)) {
            if let Err(err) = self.advance().await {
                self.close().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Releases every cursor still held and ends the stream.
    pub async fn close(&mut self) {
        let cursors: Vec<CursorHandle> = match std::mem::replace(&mut self.source, Source::Done) {
            Source::Cursors(queue) => queue.into(),
            Source::Pending(merge) => merge.cursors,
            Source::Done => Vec::new(),
        };
        self.buffer.clear();
        for cursor in cursors {
            if let Err(err) = self.executor.close_cursor(&cursor).await {
                warn!(cursor = %cursor, error = %err, "failed to close cursor");
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next().await {
                Ok(Some(doc)) => Some((Ok(doc), Some(stream))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    async fn advance(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.source, Source::Done) {
            Source::Done => Ok(()),
            Source::Cursors(queue) => {
                let Some(cursor) = queue.front().cloned() else {
                    return Ok(());
                };
                self.source = Source::Cursors(queue);
                let batch = self.executor.next_batch(&cursor, self.batch_size).await?;
                if let Source::Cursors(queue) = &mut self.source {
                    queue.pop_front();
                    if !batch.exhausted {
                        queue.push_back(cursor);
                    }
                    if queue.is_empty() {
                        self.source = Source::Done;
                    }
                }
                self.buffer.extend(batch.documents);
                Ok(())
            }
            Source::Pending(merge) => self.run_merge(merge).await,
        }
    }

    async fn run_merge(&mut self, merge: PendingMerge) -> Result<()> {
        let PendingMerge {
            namespace,
            pipeline,
            host,
            cursors,
        } = merge;

        // Drain shard outputs; unfinished cursors stay visible to `close`.
        self.source = Source::Cursors(cursors.iter().cloned().collect());
        let mut runs = Vec::with_capacity(cursors.len());
        for cursor in &cursors {
            let mut run = VecDeque::new();
            loop {
                let batch = self.executor.next_batch(cursor, self.batch_size).await?;
                run.extend(batch.documents);
                if batch.exhausted {
                    break;
                }
            }
            if let Source::Cursors(queue) = &mut self.source {
                queue.pop_front();
            }
            runs.push(run);
        }
        self.source = Source::Done;

        let input = match pipeline.stages().first() {
            Some(Stage::Sort(spec)) => merge_sorted(runs, spec),
            _ => runs.into_iter().flatten().collect(),
        };
        debug!(documents = input.len(), host = ?host, "running merge pipeline");

        match host {
            MergeHost::Router => {
                let output = run_pipeline(&pipeline, input, &ExecContext::new(&namespace, &NoOutput))?;
                self.buffer.extend(output);
            }
            MergeHost::Shard(shard) => {
                let cursor = self
                    .executor
                    .execute_merge_pipeline(&shard, &namespace, pipeline, input)
                    .await
                    .map_err(|err| err.into_router_error(&shard))?;
                self.source = Source::Cursors(VecDeque::from([cursor]));
            }
        }
        Ok(())
    }
}

/// k-way merge of runs that are each already ordered by `sort`.
fn merge_sorted(mut runs: Vec<VecDeque<Document>>, sort: &SortSpec) -> Vec<Document> {
    let total = runs.iter().map(VecDeque::len).sum();
    let mut out = Vec::with_capacity(total);
    loop {
        let mut best: Option<usize> = None;
        for (idx, run) in runs.iter().enumerate() {
            let Some(head) = run.front() else {
                continue;
            };
            let better = match best.and_then(|b| runs[b].front()) {
                None => true,
                Some(current) => sort.compare(head, current) == Ordering::Less,
            };
            if better {
                best = Some(idx);
            }
        }
        let Some(idx) = best else {
            break;
        };
        if let Some(doc) = runs[idx].pop_front() {
            out.push(doc);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SortDirection;
    use serde_json::json;

    #[test]
    fn merge_sorted_interleaves_runs_in_order() {
        let run = |values: &[i64]| -> VecDeque<Document> {
            values
                .iter()
                .map(|v| json!({ "v": v }).as_object().cloned().unwrap())
                .collect()
        };
        let sort = SortSpec {
            keys: vec![("v".into(), SortDirection::Ascending)],
        };
        let merged = merge_sorted(vec![run(&[1, 4, 9]), run(&[2, 3]), run(&[])], &sort);
        let values: Vec<_> = merged.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 9]);
    }
}
