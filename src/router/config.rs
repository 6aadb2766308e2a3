use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Result, RouterError};

/// Router configuration
///
/// Deserializable from a scenario file; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Refresh-and-replan cycles allowed per request; a request makes at
    /// most `max_stale_retries + 1` dispatch rounds.
    pub max_stale_retries: u32,

    /// Request timeout used when the caller supplies none
    pub default_timeout_ms: Option<u64>,

    /// Documents fetched per cursor batch
    pub cursor_batch_size: usize,

    /// Maximum number of namespaces kept in the routing cache
    pub routing_cache_capacity: usize,

    /// Run merges without a forced location on the router itself
    pub merge_on_router: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_stale_retries: 5,
            default_timeout_ms: None,
            cursor_batch_size: 101,
            routing_cache_capacity: 1024,
            merge_on_router: true,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stale-routing retry ceiling
    pub fn max_stale_retries(mut self, retries: u32) -> Self {
        self.max_stale_retries = retries;
        self
    }

    /// Set the default request timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the cursor batch size
    pub fn cursor_batch_size(mut self, size: usize) -> Self {
        self.cursor_batch_size = size;
        self
    }

    /// Set the routing cache capacity
    pub fn routing_cache_capacity(mut self, capacity: usize) -> Self {
        self.routing_cache_capacity = capacity;
        self
    }

    /// Choose where unconstrained merges run
    pub fn merge_on_router(mut self, enabled: bool) -> Self {
        self.merge_on_router = enabled;
        self
    }

    pub fn default_timeout_duration(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cursor_batch_size == 0 {
            return Err(RouterError::ParseError("cursor_batch_size must be > 0".into()));
        }
        if self.routing_cache_capacity == 0 {
            return Err(RouterError::ParseError("routing_cache_capacity must be > 0".into()));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(RouterError::ParseError("default_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}
