use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tracing::debug;

use super::authority::MetadataAuthority;
use super::table::CollectionRoutingInfo;
use crate::core::{Namespace, Result};

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<CollectionRoutingInfo>>>>;

/// Result of a non-blocking cache lookup.
#[derive(Debug, Clone)]
pub enum RoutingLookup {
    Sharded(Arc<CollectionRoutingInfo>),
    NotSharded(Arc<CollectionRoutingInfo>),
    NotFound,
}

impl RoutingLookup {
    pub fn info(&self) -> Option<&Arc<CollectionRoutingInfo>> {
        match self {
            Self::Sharded(info) | Self::NotSharded(info) => Some(info),
            Self::NotFound => None,
        }
    }
}

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Refreshes that issued a fetch to the authority.
    pub fetches: u64,
    /// Refreshes that joined a fetch already in flight.
    pub joined: u64,
}

/// Process-wide cache of routing tables.
///
/// # Concurrency
///
/// Lookups never block on the authority. `refresh` is the only mutator:
/// concurrent refreshes of one namespace share a single fetch, and every
/// caller receives the same value. Entries are swapped whole, so readers
/// see either the old or the new table.
pub struct RoutingTableCache {
    authority: Arc<dyn MetadataAuthority>,
    entries: Mutex<LruCache<Namespace, Arc<CollectionRoutingInfo>>>,
    inflight: Mutex<HashMap<Namespace, SharedRefresh>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    joined: AtomicU64,
}

impl RoutingTableCache {
    pub fn new(authority: Arc<dyn MetadataAuthority>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            authority,
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Most recently cached routing table for `namespace`.
    pub fn lookup(&self, namespace: &Namespace) -> Result<RoutingLookup> {
        let mut entries = self.entries.lock()?;
        let Some(info) = entries.get(namespace).cloned() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(RoutingLookup::NotFound);
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(if info.is_sharded() {
            RoutingLookup::Sharded(info)
        } else {
            RoutingLookup::NotSharded(info)
        })
    }

    /// Fetches the authoritative table and installs it.
    pub async fn refresh(&self, namespace: &Namespace) -> Result<Arc<CollectionRoutingInfo>> {
        let refresh = {
            let mut inflight = self.inflight.lock()?;
            match inflight.get(namespace) {
                Some(existing) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    debug!(namespace = %namespace, "joining in-flight routing refresh");
                    existing.clone()
                }
                None => {
                    self.fetches.fetch_add(1, Ordering::Relaxed);
                    let authority = Arc::clone(&self.authority);
                    let ns = namespace.clone();
                    let fut = async move { authority.fetch_routing_info(&ns).await.map(Arc::new) }
                        .boxed()
                        .shared();
                    inflight.insert(namespace.clone(), fut.clone());
                    fut
                }
            }
        };

        let outcome = refresh.clone().await;

        {
            let mut inflight = self.inflight.lock()?;
            if inflight
                .get(namespace)
                .is_some_and(|current| current.ptr_eq(&refresh))
            {
                inflight.remove(namespace);
            }
        }

        let fetched = outcome?;
        self.install(fetched)
    }

    /// Installs `fetched` unless the cache already holds a newer epoch.
    fn install(&self, fetched: Arc<CollectionRoutingInfo>) -> Result<Arc<CollectionRoutingInfo>> {
        let mut entries = self.entries.lock()?;
        if let Some(cached) = entries.get(fetched.namespace()) {
            if cached.epoch() > fetched.epoch() {
                return Ok(Arc::clone(cached));
            }
        }
        entries.put(fetched.namespace().clone(), Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Drops the cached entry; the next request refreshes it.
    pub fn invalidate(&self, namespace: &Namespace) -> Result<()> {
        self.entries.lock()?.pop(namespace);
        Ok(())
    }

    pub fn stats(&self) -> RoutingCacheStats {
        RoutingCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}
