use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use shardagg::core::{Document, Epoch, Namespace, ShardId};
use shardagg::dispatch::{DispatchKind, InMemoryShardCluster};
use shardagg::pipeline::Pipeline;
use shardagg::routing::{CollectionRoutingInfo, InMemoryMetadataAuthority, ShardKeyPattern};
use shardagg::{AggregateOptions, Router, RouterConfig, RouterError};

fn shard(name: &str) -> ShardId {
    ShardId::new(name)
}

fn orders() -> Namespace {
    Namespace::new("shop", "orders").unwrap()
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn pipeline(value: Value) -> Pipeline {
    Pipeline::parse(&value).unwrap()
}

/// Orders sharded on `_id`: [MinKey, 100) -> a, [100, 200) -> b, [200, MaxKey) -> c.
async fn setup() -> (InMemoryShardCluster, Router) {
    let authority = Arc::new(InMemoryMetadataAuthority::new());
    let cluster = InMemoryShardCluster::with_shards(authority, ["a", "b", "c"]).await.unwrap();
    let info = CollectionRoutingInfo::from_splits(
        orders(),
        ShardKeyPattern::new("_id"),
        Epoch::new(1),
        shard("a"),
        shard("a"),
        vec![(json!(100), shard("b")), (json!(200), shard("c"))],
    )
    .unwrap();
    let docs = vec![
        doc(json!({"_id": 1, "customer": "ana", "total": 20, "items": ["pen", "ink"]})),
        doc(json!({"_id": 42, "customer": "bo", "total": 7, "items": []})),
        doc(json!({"_id": 150, "customer": "ana", "total": 13, "items": ["pad"]})),
        doc(json!({"_id": 170, "customer": "cy", "total": 5})),
        doc(json!({"_id": 300, "customer": "cy", "total": 40, "items": ["ink"]})),
        doc(json!({"_id": 310, "customer": "bo", "total": 11, "items": ["pen"]})),
    ];
    cluster.create_collection(info, docs).await.unwrap();
    let router = Router::new(
        RouterConfig::default(),
        cluster.authority().clone(),
        Arc::new(cluster.clone()),
    )
    .unwrap();
    (cluster, router)
}

async fn aggregate(router: &Router, p: Value) -> shardagg::Result<Vec<Document>> {
    aggregate_on(router, &orders(), p).await
}

async fn aggregate_on(router: &Router, namespace: &Namespace, p: Value) -> shardagg::Result<Vec<Document>> {
    router
        .run_aggregation(namespace, &pipeline(p), AggregateOptions::new())
        .await?
        .try_collect()
        .await
}

fn field(docs: &[Document], name: &str) -> Vec<Value> {
    docs.iter().map(|d| d.get(name).cloned().unwrap_or(Value::Null)).collect()
}

#[tokio::test]
async fn test_global_sort_with_limit() {
    let (_, router) = setup().await;
    let docs = aggregate(&router, json!([{"$sort": {"total": -1}}, {"$limit": 3}]))
        .await
        .unwrap();
    assert_eq!(field(&docs, "total"), vec![json!(40), json!(20), json!(13)]);
}

#[tokio::test]
async fn test_sort_skip_and_project() {
    let (_, router) = setup().await;
    let docs = aggregate(
        &router,
        json!([
            {"$sort": {"_id": 1}},
            {"$skip": 2},
            {"$project": {"_id": 0, "customer": 1, "double": {"$multiply": ["$total", 2]}}}
        ]),
    )
    .await
    .unwrap();
    assert_eq!(docs.len(), 4);
    assert_eq!(docs[0], doc(json!({"customer": "ana", "double": 26})));
    assert_eq!(docs[3], doc(json!({"customer": "bo", "double": 22})));
}

#[tokio::test]
async fn test_group_accumulators_combine_across_shards() {
    let (_, router) = setup().await;
    let docs = aggregate(
        &router,
        json!([
            {"$group": {
                "_id": "$customer",
                "spent": {"$sum": "$total"},
                "avg": {"$avg": "$total"},
                "largest": {"$max": "$total"},
                "orders": {"$sum": 1}
            }},
            {"$sort": {"_id": 1}}
        ]),
    )
    .await
    .unwrap();
    assert_eq!(
        docs,
        vec![
            doc(json!({"_id": "ana", "spent": 33, "avg": 16.5, "largest": 20, "orders": 2})),
            doc(json!({"_id": "bo", "spent": 18, "avg": 9.0, "largest": 11, "orders": 2})),
            doc(json!({"_id": "cy", "spent": 45, "avg": 22.5, "largest": 40, "orders": 2})),
        ]
    );
}

#[tokio::test]
async fn test_count_after_targeted_match() {
    let (cluster, router) = setup().await;
    let docs = aggregate(&router, json!([{"$match": {"_id": {"$gte": 100}}}, {"$count": "n"}]))
        .await
        .unwrap();
    assert_eq!(docs, vec![doc(json!({"n": 4}))]);

    // Shard "a" owns nothing >= 100 and is never contacted.
    let contacted: Vec<ShardId> = cluster.dispatches().await.into_iter().map(|d| d.shard).collect();
    assert!(!contacted.contains(&shard("a")));
}

#[tokio::test]
async fn test_single_shard_match_runs_unsplit() {
    let (cluster, router) = setup().await;
    let p = json!([{"$match": {"_id": 150}}, {"$project": {"customer": 1}}]);
    let docs = aggregate(&router, p.clone()).await.unwrap();
    assert_eq!(docs, vec![doc(json!({"_id": 150, "customer": "ana"}))]);

    let dispatches = cluster.dispatches().await;
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].shard, shard("b"));
    assert_eq!(dispatches[0].pipeline, pipeline(p));
}

#[tokio::test]
async fn test_unwind_then_group() {
    let (_, router) = setup().await;
    let docs = aggregate(
        &router,
        json!([
            {"$unwind": "$items"},
            {"$group": {"_id": "$items", "n": {"$sum": 1}, "buyers": {"$addToSet": "$customer"}}},
            {"$sort": {"_id": 1}}
        ]),
    )
    .await
    .unwrap();
    assert_eq!(field(&docs, "_id"), vec![json!("ink"), json!("pad"), json!("pen")]);
    assert_eq!(field(&docs, "n"), vec![json!(2), json!(1), json!(2)]);
}

#[tokio::test]
async fn test_facet_sees_all_shards() {
    let (_, router) = setup().await;
    let docs = aggregate(
        &router,
        json!([{"$facet": {
            "count": [{"$count": "n"}],
            "top": [{"$sort": {"total": -1}}, {"$limit": 1}, {"$project": {"_id": 1}}]
        }}]),
    )
    .await
    .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["count"], json!([{"n": 6}]));
    assert_eq!(docs[0]["top"], json!([{"_id": 300}]));
}

#[tokio::test]
async fn test_add_fields_with_conditional() {
    let (_, router) = setup().await;
    let docs = aggregate(
        &router,
        json!([
            {"$addFields": {"size": {"$cond": [{"$gte": ["$total", 15]}, "big", "small"]}}},
            {"$match": {"size": "big"}},
            {"$sort": {"_id": 1}}
        ]),
    )
    .await
    .unwrap();
    assert_eq!(field(&docs, "_id"), vec![json!(1), json!(300)]);
}

#[tokio::test]
async fn test_out_replaces_collection_on_primary() {
    let (cluster, router) = setup().await;
    let p = json!([
        {"$group": {"_id": "$customer", "spent": {"$sum": "$total"}}},
        {"$out": "spend"}
    ]);
    let docs = aggregate(&router, p.clone()).await.unwrap();
    assert!(docs.is_empty());

    let spend = Namespace::new("shop", "spend").unwrap();
    let written = cluster.documents(&shard("a"), &spend).await;
    assert_eq!(
        written,
        vec![
            doc(json!({"_id": "ana", "spent": 33})),
            doc(json!({"_id": "bo", "spent": 18})),
            doc(json!({"_id": "cy", "spent": 45})),
        ]
    );

    let merges: Vec<_> = cluster
        .dispatches()
        .await
        .into_iter()
        .filter(|d| d.kind == DispatchKind::Merge)
        .collect();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].shard, shard("a"));

    // Running again replaces rather than appends.
    aggregate(&router, p).await.unwrap();
    assert_eq!(cluster.documents(&shard("a"), &spend).await.len(), 3);
}

#[tokio::test]
async fn test_merge_into_existing_collection() {
    let (cluster, router) = setup().await;
    let totals = Namespace::new("shop", "totals").unwrap();
    cluster
        .create_collection(
            CollectionRoutingInfo::unsharded(totals.clone(), shard("a"), Epoch::new(1)),
            vec![doc(json!({"_id": "ana", "note": "vip"}))],
        )
        .await
        .unwrap();

    aggregate(
        &router,
        json!([
            {"$group": {"_id": "$customer", "spent": {"$sum": "$total"}}},
            {"$merge": {"into": "totals"}}
        ]),
    )
    .await
    .unwrap();

    let mut written = cluster.documents(&shard("a"), &totals).await;
    written.sort_by(|a, b| a["_id"].as_str().cmp(&b["_id"].as_str()));
    assert_eq!(
        written,
        vec![
            doc(json!({"_id": "ana", "note": "vip", "spent": 33})),
            doc(json!({"_id": "bo", "spent": 18})),
            doc(json!({"_id": "cy", "spent": 45})),
        ]
    );
}

#[tokio::test]
async fn test_merge_fail_mode_surfaces_shard_error() {
    let (cluster, router) = setup().await;
    let totals = Namespace::new("shop", "totals").unwrap();
    cluster
        .create_collection(
            CollectionRoutingInfo::unsharded(totals, shard("a"), Epoch::new(1)),
            vec![doc(json!({"_id": "ana"}))],
        )
        .await
        .unwrap();

    let err = aggregate(
        &router,
        json!([
            {"$group": {"_id": "$customer"}},
            {"$merge": {"into": "totals", "whenMatched": "fail"}}
        ]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RouterError::ShardExecution { shard: ref s, .. } if *s == shard("a")));
}

#[tokio::test]
async fn test_small_batches_stream_everything() {
    let (cluster, router) = setup().await;
    let stream = router
        .run_aggregation(
            &orders(),
            &pipeline(json!([{"$match": {}}])),
            AggregateOptions::new().batch_size(1),
        )
        .await
        .unwrap();
    let docs: Vec<Document> = stream
        .into_stream()
        .map(|doc| doc.unwrap())
        .collect()
        .await;
    let mut ids: Vec<i64> = docs.iter().map(|d| d["_id"].as_i64().unwrap()).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 42, 150, 170, 300, 310]);
    assert!(cluster.open_cursors().await.is_empty());
}

#[tokio::test]
async fn test_closing_stream_early_releases_cursors() {
    let (cluster, router) = setup().await;
    let mut stream = router
        .run_aggregation(
            &orders(),
            &pipeline(json!([{"$match": {}}])),
            AggregateOptions::new().batch_size(1),
        )
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_some());
    assert!(!cluster.open_cursors().await.is_empty());

    stream.close().await;
    assert!(cluster.open_cursors().await.is_empty());
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_type_errors_propagate() {
    let (_, router) = setup().await;
    let err = aggregate(
        &router,
        json!([{"$project": {"bad": {"$add": ["$customer", 1]}}}]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RouterError::ShardExecution { .. }));
}

#[tokio::test]
async fn test_array_shard_keys_are_rejected_on_placement() {
    let (cluster, router) = setup().await;
    let readings = Namespace::new("shop", "readings").unwrap();
    let table = || {
        CollectionRoutingInfo::from_splits(
            readings.clone(),
            ShardKeyPattern::new("x"),
            Epoch::new(1),
            shard("a"),
            shard("a"),
            vec![(json!(0), shard("b"))],
        )
        .unwrap()
    };

    let err = cluster
        .create_collection(table(), vec![doc(json!({"_id": 1, "x": [-5]}))])
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ExecutionError(_)));
    assert!(cluster.documents(&shard("b"), &readings).await.is_empty());

    cluster
        .create_collection(table(), vec![doc(json!({"_id": 1, "x": -5}))])
        .await
        .unwrap();
    let err = cluster
        .insert(
            &readings,
            vec![doc(json!({"_id": 2, "x": 3})), doc(json!({"_id": 3, "x": [7]}))],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ExecutionError(_)));

    // Targeted and broadcast reads agree once every key is a scalar.
    let targeted = aggregate_on(&router, &readings, json!([{"$match": {"x": -5}}])).await.unwrap();
    let broadcast = aggregate_on(
        &router,
        &readings,
        json!([{"$addFields": {"y": 1}}, {"$match": {"x": -5}}]),
    )
    .await
    .unwrap();
    assert_eq!(field(&targeted, "_id"), vec![json!(1)]);
    assert_eq!(field(&broadcast, "_id"), vec![json!(1)]);

    // Nothing from the rejected batch was stored.
    let everything = aggregate_on(&router, &readings, json!([{"$match": {}}])).await.unwrap();
    assert_eq!(everything.len(), 1);
}
