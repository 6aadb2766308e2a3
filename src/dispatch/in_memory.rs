use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

use super::shard::{CursorBatch, CursorHandle, ShardError, ShardExecutor, ShardRequest};
use crate::core::{Document, Epoch, Namespace, Result, RouterError, ShardId};
use crate::pipeline::{ExecContext, MergeSpec, OutputSink, Pipeline, apply_merge, run_pipeline};
use crate::routing::{CollectionRoutingInfo, InMemoryMetadataAuthority, KeyBound, ShardKeyPattern};

/// Which entry point a shard request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Local,
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Opened(CursorHandle),
    Stale { actual: Epoch },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub shard: ShardId,
    pub namespace: Namespace,
    pub kind: DispatchKind,
    pub pipeline: Pipeline,
    pub believed_epoch: Option<Epoch>,
    pub result: DispatchResult,
}

/// Ordered ledger of everything the cluster was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Dispatched(DispatchRecord),
    CursorClosed(CursorHandle),
}

#[derive(Default)]
struct ShardState {
    collections: HashMap<Namespace, Vec<Document>>,
    epochs: HashMap<Namespace, Epoch>,
    failure: Option<String>,
    latency: Option<Duration>,
}

struct OpenCursor {
    handle: CursorHandle,
    remaining: VecDeque<Document>,
}

enum PendingWrite {
    Replace(Namespace, Vec<Document>),
    Merge(Namespace, Vec<Document>, MergeSpec),
}

/// Collects `$out` / `$merge` output during execution; applied afterwards.
#[derive(Default)]
struct BufferedSink {
    writes: std::sync::Mutex<Vec<PendingWrite>>,
}

impl BufferedSink {
    fn take(self) -> Result<Vec<PendingWrite>> {
        Ok(self.writes.into_inner()?)
    }
}

impl OutputSink for BufferedSink {
    fn replace_collection(&self, target: &Namespace, docs: Vec<Document>) -> Result<()> {
        self.writes.lock()?.push(PendingWrite::Replace(target.clone(), docs));
        Ok(())
    }

    fn merge_into(&self, target: &Namespace, docs: Vec<Document>, spec: &MergeSpec) -> Result<()> {
        self.writes
            .lock()?
            .push(PendingWrite::Merge(target.clone(), docs, spec.clone()));
        Ok(())
    }
}

/// An in-memory sharded cluster implementing `ShardExecutor` for tests.
///
/// Each shard keeps its own documents and its own view of every
/// collection's epoch. Chunk migrations move documents between shards and
/// bump the epoch on the donor and recipient only, so other shards and the
/// router discover the change through staleness, the way a real cluster
/// behaves.
#[derive(Clone)]
pub struct InMemoryShardCluster {
    authority: Arc<InMemoryMetadataAuthority>,
    shards: Arc<Mutex<BTreeMap<ShardId, ShardState>>>,
    cursors: Arc<Mutex<HashMap<u64, OpenCursor>>>,
    events: Arc<Mutex<Vec<ClusterEvent>>>,
    next_cursor_id: Arc<AtomicU64>,
}

impl InMemoryShardCluster {
    pub fn new(authority: Arc<InMemoryMetadataAuthority>) -> Self {
        Self {
            authority,
            shards: Arc::new(Mutex::new(BTreeMap::new())),
            cursors: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            next_cursor_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Builds a cluster with the given shard names.
    pub async fn with_shards(
        authority: Arc<InMemoryMetadataAuthority>,
        shards: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        let cluster = Self::new(authority);
        for shard in shards {
            cluster.add_shard(ShardId::new(shard)).await?;
        }
        Ok(cluster)
    }

    pub fn authority(&self) -> &Arc<InMemoryMetadataAuthority> {
        &self.authority
    }

    pub async fn add_shard(&self, shard: ShardId) -> Result<()> {
        if shard.as_str().trim().is_empty() {
            return Err(RouterError::ExecutionError("shard id must not be empty".into()));
        }
        self.shards.lock().await.entry(shard).or_default();
        Ok(())
    }

    pub async fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.lock().await.keys().cloned().collect()
    }

    /// Registers a collection with the authority and places `docs` on their owners.
    pub async fn create_collection(&self, info: CollectionRoutingInfo, docs: Vec<Document>) -> Result<()> {
        let mut shards = self.shards.lock().await;
        for owner in info.owning_shards().iter().chain(std::iter::once(info.primary_shard())) {
            if !shards.contains_key(owner) {
                return Err(RouterError::InvalidRoutingTable(format!(
                    "shard '{}' is not part of the cluster",
                    owner
                )));
            }
        }
        let placed = place_documents(&info, docs)?;
        self.authority.install(info.clone())?;

        for state in shards.values_mut() {
            state.epochs.insert(info.namespace().clone(), info.epoch());
            state.collections.entry(info.namespace().clone()).or_default();
        }
        for (owner, doc) in placed {
            if let Some(state) = shards.get_mut(&owner) {
                state
                    .collections
                    .entry(info.namespace().clone())
                    .or_default()
                    .push(doc);
            }
        }
        Ok(())
    }

    /// Inserts documents, routed with the authority's current table.
    pub async fn insert(&self, namespace: &Namespace, docs: Vec<Document>) -> Result<()> {
        let info = self.authority.current(namespace)?;
        let placed = place_documents(&info, docs)?;
        let mut shards = self.shards.lock().await;
        for (owner, doc) in placed {
            let state = shards.get_mut(&owner).ok_or_else(|| {
                RouterError::ExecutionError(format!("shard '{}' is not registered", owner))
            })?;
            state.collections.entry(namespace.clone()).or_default().push(doc);
        }
        Ok(())
    }

    /// Migrates the chunk containing `key` to `to`, moving its documents.
    ///
    /// Donor and recipient learn the new epoch; every other shard keeps
    /// its old one until a request makes it refresh.
    pub async fn move_chunk(&self, namespace: &Namespace, key: KeyBound, to: ShardId) -> Result<CollectionRoutingInfo> {
        let before = self.authority.current(namespace)?;
        let donor = before
            .chunk_for_key(&key)
            .map(|chunk| chunk.owner.clone())
            .ok_or_else(|| RouterError::InvalidRoutingTable(format!("no chunk contains {}", key)))?;

        let mut shards = self.shards.lock().await;
        if !shards.contains_key(&to) {
            return Err(RouterError::InvalidRoutingTable(format!(
                "shard '{}' is not part of the cluster",
                to
            )));
        }
        let after = self.authority.move_chunk(namespace, &key, to.clone())?;

        if donor != to {
            let moved: Vec<Document> = match shards.get_mut(&donor) {
                Some(state) => {
                    let docs = state.collections.entry(namespace.clone()).or_default();
                    let (moved, kept) = std::mem::take(docs)
                        .into_iter()
                        .partition(|doc| after.owns_document(&to, doc));
                    *docs = kept;
                    moved
                }
                None => Vec::new(),
            };
            if let Some(state) = shards.get_mut(&to) {
                state
                    .collections
                    .entry(namespace.clone())
                    .or_default()
                    .extend(moved);
            }
        }

        for shard in [&donor, &to] {
            if let Some(state) = shards.get_mut(shard) {
                state.epochs.insert(namespace.clone(), after.epoch());
            }
        }
        trace!(namespace = %namespace, donor = %donor, recipient = %to, epoch = %after.epoch(), "chunk migrated");
        Ok(after)
    }

    /// Splits a chunk; only the owning shard learns the new epoch.
    pub async fn split_chunk(&self, namespace: &Namespace, at: Value) -> Result<CollectionRoutingInfo> {
        let owner = self
            .authority
            .current(namespace)?
            .chunk_for_key(&KeyBound::Value(at.clone()))
            .map(|chunk| chunk.owner.clone());
        let after = self.authority.split_chunk(namespace, at)?;
        if let Some(owner) = owner {
            if let Some(state) = self.shards.lock().await.get_mut(&owner) {
                state.epochs.insert(namespace.clone(), after.epoch());
            }
        }
        Ok(after)
    }

    /// Shards a previously unsharded collection; the primary learns the new epoch.
    pub async fn shard_collection(&self, namespace: &Namespace, key_pattern: ShardKeyPattern) -> Result<CollectionRoutingInfo> {
        let before = self.authority.current(namespace)?;
        let mut shards = self.shards.lock().await;
        if let Some(docs) = shards
            .get(before.primary_shard())
            .and_then(|state| state.collections.get(namespace))
        {
            for doc in docs {
                key_pattern.extract(doc)?;
            }
        }
        let after = self.authority.shard_collection(namespace, key_pattern)?;
        if let Some(state) = shards.get_mut(after.primary_shard()) {
            state.epochs.insert(namespace.clone(), after.epoch());
        }
        Ok(after)
    }

    /// Makes every request to `shard` fail with `message` until cleared.
    pub async fn inject_failure(&self, shard: &ShardId, message: Option<String>) -> Result<()> {
        self.with_shard(shard, |state| state.failure = message).await
    }

    /// Delays every request to `shard`.
    pub async fn set_latency(&self, shard: &ShardId, latency: Option<Duration>) -> Result<()> {
        self.with_shard(shard, |state| state.latency = latency).await
    }

    async fn with_shard(&self, shard: &ShardId, apply: impl FnOnce(&mut ShardState)) -> Result<()> {
        let mut shards = self.shards.lock().await;
        let state = shards.get_mut(shard).ok_or_else(|| {
            RouterError::ExecutionError(format!("shard '{}' is not registered", shard))
        })?;
        apply(state);
        Ok(())
    }

    /// Documents physically stored on `shard`, orphans included.
    pub async fn documents(&self, shard: &ShardId, namespace: &Namespace) -> Vec<Document> {
        self.shards
            .lock()
            .await
            .get(shard)
            .and_then(|state| state.collections.get(namespace).cloned())
            .unwrap_or_default()
    }

    pub async fn local_epoch(&self, shard: &ShardId, namespace: &Namespace) -> Option<Epoch> {
        self.shards
            .lock()
            .await
            .get(shard)
            .and_then(|state| state.epochs.get(namespace).copied())
    }

    pub async fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().await.clone()
    }

    pub async fn dispatches(&self) -> Vec<DispatchRecord> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                ClusterEvent::Dispatched(record) => Some(record.clone()),
                ClusterEvent::CursorClosed(_) => None,
            })
            .collect()
    }

    pub async fn clear_events(&self) {
        self.events.lock().await.clear();
    }

    pub async fn open_cursors(&self) -> Vec<CursorHandle> {
        let mut open: Vec<CursorHandle> = self
            .cursors
            .lock()
            .await
            .values()
            .map(|cursor| cursor.handle.clone())
            .collect();
        open.sort();
        open
    }

    async fn record(&self, event: ClusterEvent) {
        self.events.lock().await.push(event);
    }

    async fn record_dispatch(
        &self,
        shard: &ShardId,
        namespace: &Namespace,
        kind: DispatchKind,
        pipeline: &Pipeline,
        believed_epoch: Option<Epoch>,
        result: &std::result::Result<CursorHandle, ShardError>,
    ) {
        let result = match result {
            Ok(cursor) => DispatchResult::Opened(cursor.clone()),
            Err(ShardError::StaleRoutingInfo { actual, .. }) => DispatchResult::Stale { actual: *actual },
            Err(ShardError::Execution(message)) => DispatchResult::Failed(message.clone()),
        };
        self.record(ClusterEvent::Dispatched(DispatchRecord {
            shard: shard.clone(),
            namespace: namespace.clone(),
            kind,
            pipeline: pipeline.clone(),
            believed_epoch,
            result,
        }))
        .await;
    }

    /// Latency, injected failure, then the epoch check. Returns the owned documents.
    async fn admit(
        &self,
        shard: &ShardId,
        namespace: &Namespace,
        believed: Epoch,
    ) -> std::result::Result<Vec<Document>, ShardError> {
        let latency = {
            let shards = self.shards.lock().await;
            let state = shards
                .get(shard)
                .ok_or_else(|| ShardError::Execution(format!("shard '{}' is not registered", shard)))?;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut shards = self.shards.lock().await;
        let state = shards
            .get_mut(shard)
            .ok_or_else(|| ShardError::Execution(format!("shard '{}' is not registered", shard)))?;
        if let Some(message) = &state.failure {
            return Err(ShardError::Execution(message.clone()));
        }

        let authoritative = self.authority.current(namespace)?;
        let local = match state.epochs.get(namespace).copied() {
            Some(local) if local >= believed => local,
            // The router knows something newer; refresh from the authority.
            _ => {
                state.epochs.insert(namespace.clone(), authoritative.epoch());
                authoritative.epoch()
            }
        };
        if local != believed {
            return Err(ShardError::StaleRoutingInfo {
                believed,
                actual: local,
            });
        }

        Ok(state
            .collections
            .get(namespace)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| authoritative.owns_document(shard, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn execute(
        &self,
        shard: &ShardId,
        namespace: &Namespace,
        pipeline: &Pipeline,
        input: Vec<Document>,
    ) -> std::result::Result<CursorHandle, ShardError> {
        let sink = BufferedSink::default();
        let output = run_pipeline(pipeline, input, &ExecContext::new(namespace, &sink))?;
        self.apply_writes(shard, sink.take()?).await?;
        Ok(self.open_cursor(shard, output).await)
    }

    async fn apply_writes(&self, shard: &ShardId, writes: Vec<PendingWrite>) -> Result<()> {
        for write in writes {
            let target = match &write {
                PendingWrite::Replace(target, _) | PendingWrite::Merge(target, _, _) => target.clone(),
            };
            if !self.authority.contains(&target)? {
                // Output collections are created unsharded on the writing shard.
                let info = CollectionRoutingInfo::unsharded(target.clone(), shard.clone(), Epoch::new(1));
                self.authority.install(info)?;
                let mut shards = self.shards.lock().await;
                for state in shards.values_mut() {
                    state.epochs.insert(target.clone(), Epoch::new(1));
                }
            }

            let mut shards = self.shards.lock().await;
            let state = shards.get_mut(shard).ok_or_else(|| {
                RouterError::ExecutionError(format!("shard '{}' is not registered", shard))
            })?;
            let existing = state.collections.entry(target).or_default();
            match write {
                PendingWrite::Replace(_, docs) => *existing = docs,
                PendingWrite::Merge(_, docs, spec) => apply_merge(existing, docs, &spec)?,
            }
        }
        Ok(())
    }

    async fn open_cursor(&self, shard: &ShardId, docs: Vec<Document>) -> CursorHandle {
        let handle = CursorHandle {
            shard: shard.clone(),
            cursor_id: self.next_cursor_id.fetch_add(1, Ordering::SeqCst),
        };
        self.cursors.lock().await.insert(
            handle.cursor_id,
            OpenCursor {
                handle: handle.clone(),
                remaining: docs.into(),
            },
        );
        handle
    }
}

#[async_trait]
impl ShardExecutor for InMemoryShardCluster {
    async fn execute_local_pipeline(
        &self,
        shard: &ShardId,
        request: ShardRequest,
    ) -> std::result::Result<CursorHandle, ShardError> {
        let result = match self.admit(shard, &request.namespace, request.believed_epoch).await {
            Ok(docs) => self.execute(shard, &request.namespace, &request.pipeline, docs).await,
            Err(err) => Err(err),
        };
        self.record_dispatch(
            shard,
            &request.namespace,
            DispatchKind::Local,
            &request.pipeline,
            Some(request.believed_epoch),
            &result,
        )
        .await;
        result
    }

    async fn execute_merge_pipeline(
        &self,
        shard: &ShardId,
        namespace: &Namespace,
        pipeline: Pipeline,
        input: Vec<Document>,
    ) -> std::result::Result<CursorHandle, ShardError> {
        let failure = {
            let shards = self.shards.lock().await;
            match shards.get(shard) {
                Some(state) => state.failure.clone(),
                None => Some(format!("shard '{}' is not registered", shard)),
            }
        };
        let result = match failure {
            Some(message) => Err(ShardError::Execution(message)),
            None => self.execute(shard, namespace, &pipeline, input).await,
        };
        self.record_dispatch(shard, namespace, DispatchKind::Merge, &pipeline, None, &result)
            .await;
        result
    }

    async fn next_batch(&self, cursor: &CursorHandle, batch_size: usize) -> Result<CursorBatch> {
        let mut cursors = self.cursors.lock().await;
        let open = cursors
            .get_mut(&cursor.cursor_id)
            .filter(|open| open.handle.shard == cursor.shard)
            .ok_or(RouterError::CursorNotFound(cursor.cursor_id))?;
        let take = batch_size.max(1).min(open.remaining.len());
        let documents: Vec<Document> = open.remaining.drain(..take).collect();
        let exhausted = open.remaining.is_empty();
        if exhausted {
            cursors.remove(&cursor.cursor_id);
        }
        Ok(CursorBatch { documents, exhausted })
    }

    async fn close_cursor(&self, cursor: &CursorHandle) -> Result<()> {
        let removed = self.cursors.lock().await.remove(&cursor.cursor_id);
        if removed.is_some() {
            self.record(ClusterEvent::CursorClosed(cursor.clone())).await;
        }
        Ok(())
    }
}

/// Pairs every document with its owner, failing before anything is stored.
fn place_documents(info: &CollectionRoutingInfo, docs: Vec<Document>) -> Result<Vec<(ShardId, Document)>> {
    docs.into_iter()
        .map(|doc| Ok((info.shard_for_document(&doc)?, doc)))
        .collect()
}
