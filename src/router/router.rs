use std::sync::Arc;

use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

use super::config::RouterConfig;
use super::options::AggregateOptions;
use super::session::RetrySession;
use crate::core::{Deadline, Namespace, Result, RouterError};
use crate::dispatch::{Dispatcher, RoundResult, ShardExecutor};
use crate::merge::{MergeCoordinator, ResultStream};
use crate::pipeline::{Pipeline, PipelineSplitter};
use crate::planner::{DispatchPlan, DispatchPlanner};
use crate::routing::{CollectionRoutingInfo, MetadataAuthority, RoutingTableCache, ShardSetResolver};

/// Entry point for sharded aggregations.
///
/// Each request runs the retry state machine: plan from the cached routing
/// table, dispatch, and on stale routing refresh and re-plan from the
/// original pipeline, up to `max_stale_retries` times. Callers see either a
/// complete result stream or a terminal error, never a retry.
pub struct Router {
    config: RouterConfig,
    cache: Arc<RoutingTableCache>,
    dispatcher: Dispatcher,
    planner: DispatchPlanner,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        authority: Arc<dyn MetadataAuthority>,
        executor: Arc<dyn ShardExecutor>,
    ) -> Result<Self> {
        let cache = Arc::new(RoutingTableCache::new(authority, config.routing_cache_capacity));
        Self::with_cache(config, cache, executor)
    }

    /// Builds a router on a routing cache shared with other routers.
    pub fn with_cache(
        config: RouterConfig,
        cache: Arc<RoutingTableCache>,
        executor: Arc<dyn ShardExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            planner: DispatchPlanner::new(config.merge_on_router),
            dispatcher: Dispatcher::new(executor),
            cache,
            config,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<RoutingTableCache> {
        &self.cache
    }

    pub async fn run_aggregation(
        &self,
        namespace: &Namespace,
        pipeline: &Pipeline,
        options: AggregateOptions,
    ) -> Result<ResultStream> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "router.aggregate",
            request_id = %request_id,
            namespace = %namespace
        );
        self.aggregate(namespace, pipeline, options).instrument(span).await
    }

    /// The plan the next round would use, from the cached routing table.
    pub async fn explain(&self, namespace: &Namespace, pipeline: &Pipeline) -> Result<DispatchPlan> {
        PipelineSplitter::validate(pipeline)?;
        let info = self.routing_info(namespace, None).await?;
        self.plan_round(&info, pipeline)
    }

    async fn aggregate(
        &self,
        namespace: &Namespace,
        pipeline: &Pipeline,
        options: AggregateOptions,
    ) -> Result<ResultStream> {
        // Caller misuse fails before anything is sent.
        PipelineSplitter::validate(pipeline)?;

        let deadline = options
            .timeout
            .or_else(|| self.config.default_timeout_duration())
            .map(Deadline::after);
        let batch_size = options
            .batch_size
            .unwrap_or(self.config.cursor_batch_size)
            .max(1);
        let writes = options.has_write_stages || pipeline.has_write_stage();
        let mut session = RetrySession::new(pipeline.clone(), writes);
        let mut info = self.routing_info(namespace, deadline).await?;

        loop {
            let plan = self.plan_round(&info, session.original_pipeline())?;
            session.begin_round(plan.shape());
            event!(
                Level::DEBUG,
                round = session.rounds(),
                shape = %plan.shape(),
                targets = plan.target_shards().len(),
                epoch = %info.epoch(),
                "dispatching round"
            );

            let (_, result) = self
                .dispatcher
                .dispatch(namespace, &plan, info.epoch(), deadline)
                .await;

            match result {
                RoundResult::Succeeded(cursors) => {
                    // Only a successful round reaches the merge half, and it returns,
                    // so write stages run exactly once per request.
                    let coordinator = MergeCoordinator::new(Arc::clone(self.dispatcher.executor()), batch_size);
                    let mut stream = coordinator.assemble(namespace, &plan, cursors, deadline);
                    if session.writes() {
                        // Output must be materialized before the caller hears back.
                        stream.prime().await?;
                    }
                    event!(Level::DEBUG, rounds = session.rounds(), "aggregation dispatched");
                    return Ok(stream);
                }
                RoundResult::Failed(err) => {
                    event!(Level::DEBUG, error = %err, "aggregation failed");
                    return Err(err);
                }
                RoundResult::Retry { stale } => {
                    if !session.record_stale(self.config.max_stale_retries) {
                        event!(
                            Level::WARN,
                            rounds = session.rounds(),
                            "routing table did not converge"
                        );
                        return Err(RouterError::RoutingConvergence {
                            namespace: namespace.clone(),
                            attempts: session.rounds(),
                        });
                    }
                    event!(
                        Level::INFO,
                        attempt = session.attempts_made(),
                        stale_shards = stale.len(),
                        previous_shape = ?session.last_plan_shape(),
                        "stale routing info, refreshing"
                    );
                    info = self.refresh(namespace, deadline).await?;
                }
            }
        }
    }

    /// Plans from scratch: the plan is derived from the routing table and
    /// the original pipeline, never from a previous round's plan.
    fn plan_round(&self, info: &CollectionRoutingInfo, pipeline: &Pipeline) -> Result<DispatchPlan> {
        let leading_filter = pipeline.leading_filter();
        let targets = ShardSetResolver::resolve_targets(info, leading_filter.as_ref());
        self.planner.plan(&targets, pipeline, info.primary_shard())
    }

    async fn routing_info(
        &self,
        namespace: &Namespace,
        deadline: Option<Deadline>,
    ) -> Result<Arc<CollectionRoutingInfo>> {
        match self.cache.lookup(namespace)?.info() {
            Some(info) => Ok(Arc::clone(info)),
            None => self.refresh(namespace, deadline).await,
        }
    }

    async fn refresh(
        &self,
        namespace: &Namespace,
        deadline: Option<Deadline>,
    ) -> Result<Arc<CollectionRoutingInfo>> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.instant(), self.cache.refresh(namespace))
                .await
                .map_err(|_| deadline.timeout_error())?,
            None => self.cache.refresh(namespace).await,
        }
    }
}
