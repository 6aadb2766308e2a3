use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::value::compare_values;
use crate::core::{Document, Result, RouterError, ShardId};

/// A point in the shard-key space, extended with the two sentinels that
/// bracket every real value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyBound {
    MinKey,
    Value(Value),
    MaxKey,
}

impl KeyBound {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

impl PartialEq for KeyBound {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyBound {}

impl PartialOrd for KeyBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::MinKey, Self::MinKey) | (Self::MaxKey, Self::MaxKey) => Ordering::Equal,
            (Self::MinKey, _) | (_, Self::MaxKey) => Ordering::Less,
            (_, Self::MinKey) | (Self::MaxKey, _) => Ordering::Greater,
            (Self::Value(a), Self::Value(b)) => compare_values(a, b),
        }
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinKey => f.write_str("MinKey"),
            Self::MaxKey => f.write_str("MaxKey"),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Single-field ranged shard key, e.g. `{_id: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub field: String,
}

impl ShardKeyPattern {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// Shard key of a document; a missing field routes as `null`.
    ///
    /// Arrays are rejected anywhere along the key path. A filter on the key
    /// matches array elements, so a document placed by its whole array
    /// would be invisible to a targeted query.
    pub fn extract(&self, doc: &Document) -> Result<KeyBound> {
        let mut current: Option<&Value> = None;
        for part in self.field.split('.') {
            let next = match current {
                None => doc.get(part),
                Some(Value::Object(obj)) => obj.get(part),
                Some(Value::Array(_)) => return Err(self.array_key_error()),
                Some(_) => None,
            };
            match next {
                Some(value) => current = Some(value),
                None => return Ok(KeyBound::Value(Value::Null)),
            }
        }
        match current {
            Some(Value::Array(_)) => Err(self.array_key_error()),
            Some(value) => Ok(KeyBound::Value(value.clone())),
            None => Ok(KeyBound::Value(Value::Null)),
        }
    }

    fn array_key_error(&self) -> RouterError {
        RouterError::ExecutionError(format!("shard key '{}' cannot contain an array", self.field))
    }
}

/// Half-open key range `[min, max)` owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: KeyBound,
    pub max: KeyBound,
    pub owner: ShardId,
}

impl ChunkRange {
    pub fn new(min: KeyBound, max: KeyBound, owner: ShardId) -> Self {
        Self { min, max, owner }
    }

    pub fn contains(&self, key: &KeyBound) -> bool {
        *key >= self.min && (*key < self.max || (self.max == KeyBound::MaxKey && *key == KeyBound::MaxKey))
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}) -> {}", self.min, self.max, self.owner)
    }
}
