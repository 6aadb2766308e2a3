use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shardagg::core::{Epoch, Namespace, ShardId};
use shardagg::routing::{
    CollectionRoutingInfo, InMemoryMetadataAuthority, KeyBound, RoutingLookup, RoutingTableCache,
    ShardKeyPattern,
};
use shardagg::RouterError;
use tokio_test::{assert_err, assert_ok};

fn ns() -> Namespace {
    Namespace::new("test", "coll").unwrap()
}

fn sharded_table() -> CollectionRoutingInfo {
    CollectionRoutingInfo::from_splits(
        ns(),
        ShardKeyPattern::new("_id"),
        Epoch::new(1),
        ShardId::new("s0"),
        ShardId::new("s0"),
        vec![(json!(100), ShardId::new("s1"))],
    )
    .unwrap()
}

fn setup() -> (Arc<InMemoryMetadataAuthority>, RoutingTableCache) {
    let authority = Arc::new(InMemoryMetadataAuthority::new());
    authority.install(sharded_table()).unwrap();
    let cache = RoutingTableCache::new(authority.clone(), 16);
    (authority, cache)
}

#[tokio::test]
async fn test_lookup_misses_until_refreshed() {
    let (_, cache) = setup();
    assert!(matches!(cache.lookup(&ns()).unwrap(), RoutingLookup::NotFound));

    let info = cache.refresh(&ns()).await.unwrap();
    assert_eq!(info.epoch(), Epoch::new(1));
    match cache.lookup(&ns()).unwrap() {
        RoutingLookup::Sharded(cached) => assert_eq!(cached.epoch(), Epoch::new(1)),
        other => panic!("expected sharded entry, got {:?}", other),
    }
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.fetches, 1);
}

#[tokio::test]
async fn test_refresh_picks_up_migrations() {
    let (authority, cache) = setup();
    cache.refresh(&ns()).await.unwrap();

    authority
        .move_chunk(&ns(), &KeyBound::value(150), ShardId::new("s0"))
        .unwrap();
    // The cache keeps serving the old table until someone refreshes.
    assert_eq!(cache.lookup(&ns()).unwrap().info().unwrap().epoch(), Epoch::new(1));

    let refreshed = cache.refresh(&ns()).await.unwrap();
    assert!(refreshed.epoch() > Epoch::new(1));
    assert_eq!(refreshed.owning_shards().len(), 1);
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_fetch() {
    let (authority, cache) = setup();
    authority.set_fetch_delay(Some(Duration::from_millis(50))).unwrap();
    let cache = Arc::new(cache);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move { cache.refresh(&ns()).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(authority.fetch_count(), 1);
    assert!(results.iter().all(|info| Arc::ptr_eq(info, &results[0])));
    let stats = cache.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.joined, 7);
}

#[tokio::test]
async fn test_sequential_refreshes_fetch_again() {
    let (authority, cache) = setup();
    cache.refresh(&ns()).await.unwrap();
    cache.refresh(&ns()).await.unwrap();
    assert_eq!(authority.fetch_count(), 2);
}

#[tokio::test]
async fn test_missing_namespace_and_unavailable_authority() {
    let (authority, cache) = setup();
    let other = Namespace::new("test", "missing").unwrap();
    let err = cache.refresh(&other).await.unwrap_err();
    assert_eq!(err, RouterError::NamespaceNotFound(other.clone()));
    assert!(matches!(cache.lookup(&other).unwrap(), RoutingLookup::NotFound));

    authority.set_unavailable(Some("config servers down".into())).unwrap();
    let err = cache.refresh(&ns()).await.unwrap_err();
    assert!(matches!(err, RouterError::MetadataUnavailable(_)));

    // A failed refresh does not poison later ones.
    authority.set_unavailable(None).unwrap();
    assert_ok!(cache.refresh(&ns()).await);
}

#[tokio::test]
async fn test_invalidate_drops_entry() {
    let (_, cache) = setup();
    cache.refresh(&ns()).await.unwrap();
    cache.invalidate(&ns()).unwrap();
    assert!(matches!(cache.lookup(&ns()).unwrap(), RoutingLookup::NotFound));
}

#[test]
fn test_authority_rejects_epoch_regression() {
    let authority = InMemoryMetadataAuthority::new();
    authority.install(sharded_table()).unwrap();
    let err = assert_err!(authority.install(sharded_table()));
    assert!(matches!(err, RouterError::InvalidRoutingTable(_)));
}

#[test]
fn test_table_rejects_gaps() {
    let result = CollectionRoutingInfo::sharded(
        ns(),
        ShardKeyPattern::new("_id"),
        Epoch::new(1),
        ShardId::new("s0"),
        vec![shardagg::routing::ChunkRange::new(
            KeyBound::MinKey,
            KeyBound::value(10),
            ShardId::new("s0"),
        )],
    );
    assert!(matches!(result, Err(RouterError::InvalidRoutingTable(_))));
}
