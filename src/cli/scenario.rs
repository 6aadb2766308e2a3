//! JSON description of an in-memory cluster for the CLI.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use shardagg::core::{Document, Epoch, Namespace, ShardId};
use shardagg::routing::{CollectionRoutingInfo, ShardKeyPattern};
use shardagg::{InMemoryMetadataAuthority, InMemoryShardCluster, RouterConfig};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub shards: Vec<String>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub collections: Vec<CollectionSetup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSetup {
    pub namespace: Namespace,
    pub primary: ShardId,
    /// Absent for unsharded collections.
    pub shard_key: Option<String>,
    /// Owner of the chunk starting at MinKey; defaults to the primary.
    pub first_owner: Option<ShardId>,
    #[serde(default)]
    pub splits: Vec<(Value, ShardId)>,
    #[serde(default)]
    pub documents: Vec<Document>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    /// Builds the cluster; every collection starts at epoch 1.
    pub async fn build(self) -> Result<InMemoryShardCluster> {
        let authority = Arc::new(InMemoryMetadataAuthority::new());
        let cluster = InMemoryShardCluster::with_shards(authority, self.shards).await?;

        for setup in self.collections {
            let info = match setup.shard_key {
                None => CollectionRoutingInfo::unsharded(setup.namespace, setup.primary, Epoch::new(1)),
                Some(field) => CollectionRoutingInfo::from_splits(
                    setup.namespace,
                    ShardKeyPattern::new(field),
                    Epoch::new(1),
                    setup.primary.clone(),
                    setup.first_owner.unwrap_or(setup.primary),
                    setup.splits,
                )?,
            };
            cluster.create_collection(info, setup.documents).await?;
        }
        Ok(cluster)
    }
}
