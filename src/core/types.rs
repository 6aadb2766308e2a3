use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{Result, RouterError};

/// A document flowing through a pipeline.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Identifier of a shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Fully qualified collection name: `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let collection = collection.into();
        if db.trim().is_empty() || collection.trim().is_empty() {
            return Err(RouterError::ParseError(format!(
                "namespace parts must not be empty: '{}.{}'",
                db, collection
            )));
        }
        Ok(Self { db, collection })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Another collection in the same database.
    pub fn sibling(&self, collection: &str) -> Result<Self> {
        Self::new(self.db.clone(), collection)
    }
}

impl FromStr for Namespace {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        let (db, collection) = s.split_once('.').ok_or_else(|| {
            RouterError::ParseError(format!("namespace '{}' must look like db.collection", s))
        })?;
        Self::new(db, collection)
    }
}

impl TryFrom<String> for Namespace {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Version stamp of a collection's chunk layout.
///
/// Every ownership change produces a strictly larger epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute point in time a request must finish by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn has_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn timeout_error(&self) -> RouterError {
        RouterError::Timeout(self.budget)
    }
}
