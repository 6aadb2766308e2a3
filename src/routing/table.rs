use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chunk::{ChunkRange, KeyBound, ShardKeyPattern};
use crate::core::{Document, Epoch, Namespace, Result, RouterError, ShardId};

/// Chunk layout of a sharded collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedLayout {
    pub key_pattern: ShardKeyPattern,
    pub chunks: Vec<ChunkRange>,
}

/// Routing metadata of one collection at one epoch.
///
/// Values are immutable: every ownership change goes through one of the
/// `with_*` transitions, which return a new value with a larger epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRoutingInfo {
    namespace: Namespace,
    epoch: Epoch,
    primary_shard: ShardId,
    layout: Option<ShardedLayout>,
}

impl CollectionRoutingInfo {
    /// An unsharded collection living entirely on its primary shard.
    pub fn unsharded(namespace: Namespace, primary_shard: ShardId, epoch: Epoch) -> Self {
        Self {
            namespace,
            epoch,
            primary_shard,
            layout: None,
        }
    }

    /// A sharded collection with an explicit chunk list.
    pub fn sharded(
        namespace: Namespace,
        key_pattern: ShardKeyPattern,
        epoch: Epoch,
        primary_shard: ShardId,
        chunks: Vec<ChunkRange>,
    ) -> Result<Self> {
        let info = Self {
            namespace,
            epoch,
            primary_shard,
            layout: Some(ShardedLayout { key_pattern, chunks }),
        };
        info.validate()?;
        Ok(info)
    }

    /// Builds a sharded layout from split points.
    ///
    /// `first_owner` owns `[MinKey, splits[0])`; each `(point, owner)` starts a
    /// chunk that runs to the next split point, the last one to MaxKey.
    pub fn from_splits(
        namespace: Namespace,
        key_pattern: ShardKeyPattern,
        epoch: Epoch,
        primary_shard: ShardId,
        first_owner: ShardId,
        splits: Vec<(Value, ShardId)>,
    ) -> Result<Self> {
        let mut chunks = Vec::with_capacity(splits.len() + 1);
        let mut min = KeyBound::MinKey;
        let mut owner = first_owner;
        for (point, next_owner) in splits {
            let bound = KeyBound::Value(point);
            chunks.push(ChunkRange::new(min, bound.clone(), owner));
            min = bound;
            owner = next_owner;
        }
        chunks.push(ChunkRange::new(min, KeyBound::MaxKey, owner));
        Self::sharded(namespace, key_pattern, epoch, primary_shard, chunks)
    }

    pub fn validate(&self) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        let invalid = |msg: String| -> Result<()> {
            Err(RouterError::InvalidRoutingTable(format!(
                "{} (namespace {}): {}",
                self.epoch, self.namespace, msg
            )))
        };

        let (Some(first), Some(last)) = (layout.chunks.first(), layout.chunks.last()) else {
            return invalid("sharded collection has no chunks".to_string());
        };
        if first.min != KeyBound::MinKey {
            return invalid(format!("first chunk starts at {} instead of MinKey", first.min));
        }
        if last.max != KeyBound::MaxKey {
            return invalid(format!("last chunk ends at {} instead of MaxKey", last.max));
        }
        for chunk in &layout.chunks {
            if chunk.min >= chunk.max {
                return invalid(format!("empty chunk {}", chunk));
            }
        }
        for pair in layout.chunks.windows(2) {
            if pair[0].max != pair[1].min {
                return invalid(format!("chunks {} and {} are not contiguous", pair[0], pair[1]));
            }
        }
        Ok(())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn primary_shard(&self) -> &ShardId {
        &self.primary_shard
    }

    pub fn is_sharded(&self) -> bool {
        self.layout.is_some()
    }

    pub fn key_pattern(&self) -> Option<&ShardKeyPattern> {
        self.layout.as_ref().map(|layout| &layout.key_pattern)
    }

    /// Ordered chunk list; empty for unsharded collections.
    pub fn chunks(&self) -> &[ChunkRange] {
        self.layout
            .as_ref()
            .map(|layout| layout.chunks.as_slice())
            .unwrap_or(&[])
    }

    pub fn chunk_for_key(&self, key: &KeyBound) -> Option<&ChunkRange> {
        let chunks = self.chunks();
        let idx = chunks.partition_point(|chunk| chunk.max <= *key);
        chunks
            .get(idx.min(chunks.len().saturating_sub(1)))
            .filter(|chunk| chunk.contains(key))
    }

    /// Shard that owns `doc` under this layout.
    pub fn shard_for_document(&self, doc: &Document) -> Result<ShardId> {
        match &self.layout {
            None => Ok(self.primary_shard.clone()),
            Some(layout) => {
                let key = layout.key_pattern.extract(doc)?;
                Ok(self
                    .chunk_for_key(&key)
                    .map(|chunk| chunk.owner.clone())
                    .unwrap_or_else(|| self.primary_shard.clone()))
            }
        }
    }

    /// Every shard that owns at least one chunk (the primary when unsharded).
    pub fn owning_shards(&self) -> BTreeSet<ShardId> {
        match &self.layout {
            None => BTreeSet::from([self.primary_shard.clone()]),
            Some(layout) => layout.chunks.iter().map(|c| c.owner.clone()).collect(),
        }
    }

    /// False for documents whose shard key cannot be routed.
    pub fn owns_document(&self, shard: &ShardId, doc: &Document) -> bool {
        matches!(self.shard_for_document(doc), Ok(owner) if owner == *shard)
    }

    /// Moves the chunk containing `key` to `to`.
    pub fn with_chunk_moved(&self, key: &KeyBound, to: ShardId) -> Result<Self> {
        let mut next = self.clone();
        let layout = next.layout.as_mut().ok_or_else(|| {
            RouterError::InvalidRoutingTable(format!("{} is not sharded", self.namespace))
        })?;
        let chunk = layout
            .chunks
            .iter_mut()
            .find(|chunk| chunk.contains(key))
            .ok_or_else(|| RouterError::InvalidRoutingTable(format!("no chunk contains {}", key)))?;
        chunk.owner = to;
        next.epoch = self.epoch.next();
        Ok(next)
    }

    /// Splits the chunk containing `at` into `[min, at)` and `[at, max)`.
    pub fn with_split(&self, at: Value) -> Result<Self> {
        let at = KeyBound::Value(at);
        let mut next = self.clone();
        let layout = next.layout.as_mut().ok_or_else(|| {
            RouterError::InvalidRoutingTable(format!("{} is not sharded", self.namespace))
        })?;
        let idx = layout
            .chunks
            .iter()
            .position(|chunk| chunk.contains(&at))
            .ok_or_else(|| RouterError::InvalidRoutingTable(format!("no chunk contains {}", at)))?;
        if layout.chunks[idx].min == at {
            return Err(RouterError::InvalidRoutingTable(format!(
                "{} is already a chunk boundary",
                at
            )));
        }
        let upper = ChunkRange::new(
            at.clone(),
            layout.chunks[idx].max.clone(),
            layout.chunks[idx].owner.clone(),
        );
        layout.chunks[idx].max = at;
        layout.chunks.insert(idx + 1, upper);
        next.epoch = self.epoch.next();
        next.validate()?;
        Ok(next)
    }

    /// Shards a collection in place: one chunk covering everything, on the primary.
    pub fn sharded_from(&self, key_pattern: ShardKeyPattern) -> Result<Self> {
        if self.is_sharded() {
            return Err(RouterError::InvalidRoutingTable(format!(
                "{} is already sharded",
                self.namespace
            )));
        }
        Self::sharded(
            self.namespace.clone(),
            key_pattern,
            self.epoch.next(),
            self.primary_shard.clone(),
            vec![ChunkRange::new(
                KeyBound::MinKey,
                KeyBound::MaxKey,
                self.primary_shard.clone(),
            )],
        )
    }
}
