use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::chunk::{KeyBound, ShardKeyPattern};
use super::table::CollectionRoutingInfo;
use crate::core::{Namespace, Result, RouterError, ShardId};

/// The authoritative source of routing metadata (the config servers).
#[async_trait]
pub trait MetadataAuthority: Send + Sync {
    /// Fetches the current routing table of `namespace`.
    async fn fetch_routing_info(&self, namespace: &Namespace) -> Result<CollectionRoutingInfo>;
}

/// In-process metadata authority.
///
/// Holds the current routing table per collection, applies chunk
/// migrations and splits, and counts fetches so tests can assert on refresh
/// deduplication.
#[derive(Default)]
pub struct InMemoryMetadataAuthority {
    collections: Mutex<HashMap<Namespace, CollectionRoutingInfo>>,
    fetches: AtomicU64,
    fetch_delay: Mutex<Option<Duration>>,
    unavailable: Mutex<Option<String>>,
}

impl InMemoryMetadataAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the routing table of a collection.
    pub fn install(&self, info: CollectionRoutingInfo) -> Result<()> {
        info.validate()?;
        let mut collections = self.collections.lock()?;
        if let Some(existing) = collections.get(info.namespace()) {
            if info.epoch() <= existing.epoch() {
                return Err(RouterError::InvalidRoutingTable(format!(
                    "epoch {} for {} does not advance past {}",
                    info.epoch(),
                    info.namespace(),
                    existing.epoch()
                )));
            }
        }
        collections.insert(info.namespace().clone(), info);
        Ok(())
    }

    pub fn current(&self, namespace: &Namespace) -> Result<CollectionRoutingInfo> {
        let collections = self.collections.lock()?;
        collections
            .get(namespace)
            .cloned()
            .ok_or_else(|| RouterError::NamespaceNotFound(namespace.clone()))
    }

    pub fn contains(&self, namespace: &Namespace) -> Result<bool> {
        Ok(self.collections.lock()?.contains_key(namespace))
    }

    /// Commits a migration of the chunk containing `key`; returns the new table.
    pub fn move_chunk(
        &self,
        namespace: &Namespace,
        key: &KeyBound,
        to: ShardId,
    ) -> Result<CollectionRoutingInfo> {
        self.transition(namespace, |info| info.with_chunk_moved(key, to))
    }

    pub fn split_chunk(&self, namespace: &Namespace, at: Value) -> Result<CollectionRoutingInfo> {
        self.transition(namespace, |info| info.with_split(at))
    }

    pub fn shard_collection(
        &self,
        namespace: &Namespace,
        key_pattern: ShardKeyPattern,
    ) -> Result<CollectionRoutingInfo> {
        self.transition(namespace, |info| info.sharded_from(key_pattern))
    }

    fn transition(
        &self,
        namespace: &Namespace,
        apply: impl FnOnce(&CollectionRoutingInfo) -> Result<CollectionRoutingInfo>,
    ) -> Result<CollectionRoutingInfo> {
        let mut collections = self.collections.lock()?;
        let current = collections
            .get(namespace)
            .ok_or_else(|| RouterError::NamespaceNotFound(namespace.clone()))?;
        let next = apply(current)?;
        collections.insert(namespace.clone(), next.clone());
        Ok(next)
    }

    /// Number of `fetch_routing_info` calls served so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Delays every fetch, to widen windows for concurrent refreshes.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) -> Result<()> {
        *self.fetch_delay.lock()? = delay;
        Ok(())
    }

    /// Makes every fetch fail until cleared.
    pub fn set_unavailable(&self, reason: Option<String>) -> Result<()> {
        *self.unavailable.lock()? = reason;
        Ok(())
    }
}

#[async_trait]
impl MetadataAuthority for InMemoryMetadataAuthority {
    async fn fetch_routing_info(&self, namespace: &Namespace) -> Result<CollectionRoutingInfo> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock()?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.unavailable.lock()?.clone() {
            return Err(RouterError::MetadataUnavailable(reason));
        }
        self.current(namespace)
    }
}
