use std::collections::BTreeSet;

use serde_json::Value;
use tracing::trace;

use super::chunk::KeyBound;
use super::predicate::extract_key_predicate;
use super::table::CollectionRoutingInfo;
use crate::core::{Document, ShardId};

/// Maps a routing table plus the pipeline's leading filter to target shards.
pub struct ShardSetResolver;

impl ShardSetResolver {
    /// Smallest set of shards that can hold a document matching `leading_filter`.
    ///
    /// Never empty: an unsharded collection targets its primary, and a filter
    /// no key can satisfy targets the owner of the MinKey chunk so the
    /// pipeline still runs somewhere and produces its (empty) result.
    pub fn resolve_targets(
        info: &CollectionRoutingInfo,
        leading_filter: Option<&Document>,
    ) -> BTreeSet<ShardId> {
        let Some(key_pattern) = info.key_pattern() else {
            return BTreeSet::from([info.primary_shard().clone()]);
        };

        let predicate = leading_filter.and_then(|filter| extract_key_predicate(filter, &key_pattern.field));
        let Some(predicate) = predicate else {
            trace!(namespace = %info.namespace(), "no shard-key constraint, broadcasting");
            return info.owning_shards();
        };

        let targets: BTreeSet<ShardId> = info
            .chunks()
            .iter()
            .filter(|chunk| predicate.intervals().iter().any(|interval| interval.overlaps(chunk)))
            .map(|chunk| chunk.owner.clone())
            .collect();

        if targets.is_empty() {
            let fallback = info
                .chunk_for_key(&KeyBound::MinKey)
                .map(|chunk| chunk.owner.clone())
                .unwrap_or_else(|| info.primary_shard().clone());
            return BTreeSet::from([fallback]);
        }
        targets
    }

    /// Shard owning the exact key `value`, when the collection is sharded.
    pub fn shard_for_key(info: &CollectionRoutingInfo, value: Value) -> ShardId {
        info.chunk_for_key(&KeyBound::Value(value))
            .map(|chunk| chunk.owner.clone())
            .unwrap_or_else(|| info.primary_shard().clone())
    }
}
