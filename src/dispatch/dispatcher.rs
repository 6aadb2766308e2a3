use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::shard::{CursorHandle, ShardError, ShardExecutor, ShardRequest};
use crate::core::{Deadline, Epoch, Namespace, RouterError, ShardId};
use crate::planner::DispatchPlan;

/// What one shard answered in a round.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(CursorHandle),
    StaleRoutingInfo { believed: Epoch, actual: Epoch },
    HardError(RouterError),
}

/// One dispatch round: the plan and every shard's outcome.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    pub plan: DispatchPlan,
    pub outcomes: BTreeMap<ShardId, Outcome>,
}

/// Classification of a finished round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundResult {
    Succeeded(Vec<CursorHandle>),
    Retry { stale: Vec<(ShardId, Epoch)> },
    Failed(RouterError),
}

impl DispatchAttempt {
    /// Hard errors win over staleness; a round succeeds only if every shard did.
    pub fn classify(&self) -> RoundResult {
        if let Some(err) = self.outcomes.values().find_map(|outcome| match outcome {
            Outcome::HardError(err) => Some(err.clone()),
            _ => None,
        }) {
            return RoundResult::Failed(err);
        }

        let stale: Vec<(ShardId, Epoch)> = self
            .outcomes
            .iter()
            .filter_map(|(shard, outcome)| match outcome {
                Outcome::StaleRoutingInfo { actual, .. } => Some((shard.clone(), *actual)),
                _ => None,
            })
            .collect();
        if !stale.is_empty() {
            return RoundResult::Retry { stale };
        }

        RoundResult::Succeeded(self.opened_cursors())
    }

    pub fn opened_cursors(&self) -> Vec<CursorHandle> {
        self.outcomes
            .values()
            .filter_map(|outcome| match outcome {
                Outcome::Success(cursor) => Some(cursor.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Fans a plan's shard requests out concurrently and collects the round.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn ShardExecutor>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn ShardExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn ShardExecutor> {
        &self.executor
    }

    /// Runs one round. Cursors of a round that is not `Succeeded` are
    /// released before this returns.
    pub async fn dispatch(
        &self,
        namespace: &Namespace,
        plan: &DispatchPlan,
        believed_epoch: Epoch,
        deadline: Option<Deadline>,
    ) -> (DispatchAttempt, RoundResult) {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (shard, pipeline) in plan.shard_requests() {
            let executor = Arc::clone(&self.executor);
            let token = token.clone();
            let request = ShardRequest {
                namespace: namespace.clone(),
                pipeline,
                believed_epoch,
            };
            tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    result = executor.execute_local_pipeline(&shard, request) => Some(result),
                    _ = token.cancelled() => None,
                };
                let outcome = result.map(|result| match result {
                    Ok(cursor) => Outcome::Success(cursor),
                    Err(ShardError::StaleRoutingInfo { believed, actual }) => {
                        Outcome::StaleRoutingInfo { believed, actual }
                    }
                    Err(err) => Outcome::HardError(err.into_router_error(&shard)),
                });
                (shard, outcome)
            });
        }

        let mut attempt = DispatchAttempt {
            plan: plan.clone(),
            outcomes: BTreeMap::new(),
        };
        let mut first_error: Option<RouterError> = None;
        let mut timed_out = false;

        loop {
            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline.instant(), tasks.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            timed_out = true;
                            token.cancel();
                            break;
                        }
                    }
                }
                None => tasks.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((shard, Some(outcome))) => {
                    if let Outcome::HardError(err) = &outcome {
                        if first_error.is_none() {
                            debug!(shard = %shard, error = %err, "hard error, cancelling round");
                            first_error = Some(err.clone());
                        }
                        token.cancel();
                    }
                    attempt.outcomes.insert(shard, outcome);
                }
                Ok((_, None)) => {}
                Err(join_err) => {
                    token.cancel();
                    if first_error.is_none() {
                        first_error = Some(RouterError::ExecutionError(format!(
                            "shard request task failed: {}",
                            join_err
                        )));
                    }
                }
            }
        }

        if timed_out {
            // Cancelled tasks finish promptly; collect anything they opened.
            while let Some(joined) = tasks.join_next().await {
                if let Ok((shard, Some(outcome))) = joined {
                    attempt.outcomes.insert(shard, outcome);
                }
            }
            self.release(attempt.opened_cursors()).await;
            let err = deadline
                .map(|d| d.timeout_error())
                .unwrap_or_else(|| RouterError::ExecutionError("round timed out".into()));
            return (attempt, RoundResult::Failed(err));
        }

        let result = match first_error {
            Some(err) => RoundResult::Failed(err),
            None => attempt.classify(),
        };
        if !matches!(result, RoundResult::Succeeded(_)) {
            self.release(attempt.opened_cursors()).await;
        }
        (attempt, result)
    }

    /// Closes cursors concurrently; failures are logged, not propagated.
    pub async fn release(&self, cursors: Vec<CursorHandle>) {
        if cursors.is_empty() {
            return;
        }
        debug!(count = cursors.len(), "releasing abandoned cursors");
        let closes = cursors.iter().map(|cursor| self.executor.close_cursor(cursor));
        for (cursor, result) in cursors.iter().zip(join_all(closes).await) {
            if let Err(err) = result {
                warn!(cursor = %cursor, error = %err, "failed to release cursor");
            }
        }
    }
}
