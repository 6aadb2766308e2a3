use std::collections::BTreeSet;

use serde_json::{Value, json};
use shardagg::core::{Document, Epoch, Namespace, ShardId};
use shardagg::pipeline::{MergeLocation, Pipeline, PipelineSplitter, Stage};
use shardagg::planner::{DispatchPlan, DispatchPlanner, MergeHost, PlanShape};
use shardagg::routing::{CollectionRoutingInfo, KeyBound, ShardKeyPattern, ShardSetResolver};

fn shard(name: &str) -> ShardId {
    ShardId::new(name)
}

fn shards(names: &[&str]) -> BTreeSet<ShardId> {
    names.iter().map(|name| shard(name)).collect()
}

fn filter(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn pipeline(value: Value) -> Pipeline {
    Pipeline::parse(&value).unwrap()
}

/// `x` ranges: [MinKey, 0) -> s0, [0, 100) -> s1, [100, MaxKey) -> s2.
fn three_shard_table() -> CollectionRoutingInfo {
    CollectionRoutingInfo::from_splits(
        Namespace::new("test", "coll").unwrap(),
        ShardKeyPattern::new("x"),
        Epoch::new(1),
        shard("s0"),
        shard("s0"),
        vec![(json!(0), shard("s1")), (json!(100), shard("s2"))],
    )
    .unwrap()
}

#[test]
fn test_unsharded_collection_targets_primary() {
    let info = CollectionRoutingInfo::unsharded(Namespace::new("test", "plain").unwrap(), shard("s1"), Epoch::new(1));
    let targets = ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": 5}))));
    assert_eq!(targets, shards(&["s1"]));
}

#[test]
fn test_no_filter_broadcasts_to_owning_shards() {
    let info = three_shard_table();
    assert_eq!(ShardSetResolver::resolve_targets(&info, None), shards(&["s0", "s1", "s2"]));
    // A filter that does not mention the shard key constrains nothing.
    assert_eq!(
        ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"y": 1})))),
        shards(&["s0", "s1", "s2"])
    );
}

#[test]
fn test_equality_and_range_filters_narrow_targets() {
    let info = three_shard_table();
    assert_eq!(
        ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": 42})))),
        shards(&["s1"])
    );
    assert_eq!(
        ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": {"$gte": 50, "$lt": 150}})))),
        shards(&["s1", "s2"])
    );
    assert_eq!(
        ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": {"$lt": 0}})))),
        shards(&["s0"])
    );
    assert_eq!(
        ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": {"$in": [-5, 200]}})))),
        shards(&["s0", "s2"])
    );
    assert_eq!(
        ShardSetResolver::resolve_targets(
            &info,
            Some(&filter(json!({"$or": [{"x": 1}, {"x": 101}]})))
        ),
        shards(&["s1", "s2"])
    );
}

#[test]
fn test_contradictory_filter_still_targets_one_shard() {
    let info = three_shard_table();
    let targets = ShardSetResolver::resolve_targets(&info, Some(&filter(json!({"x": {"$gt": 10, "$lt": 5}}))));
    assert_eq!(targets, shards(&["s0"]));
}

#[test]
fn test_shard_key_extraction_rejects_arrays() {
    let key = ShardKeyPattern::new("loc.x");
    assert_eq!(key.extract(&filter(json!({"loc": {"x": 5}}))).unwrap(), KeyBound::value(5));
    assert_eq!(key.extract(&filter(json!({"other": 1}))).unwrap(), KeyBound::Value(Value::Null));
    assert!(key.extract(&filter(json!({"loc": {"x": [5]}}))).is_err());
    assert!(key.extract(&filter(json!({"loc": [{"x": 5}]}))).is_err());

    let info = three_shard_table();
    assert_eq!(info.shard_for_document(&filter(json!({"x": 42}))).unwrap(), shard("s1"));
    assert!(matches!(
        info.shard_for_document(&filter(json!({"x": [-5]}))),
        Err(shardagg::RouterError::ExecutionError(_))
    ));
    assert!(!info.owns_document(&shard("s0"), &filter(json!({"x": [-5]}))));
    assert!(!info.owns_document(&shard("s2"), &filter(json!({"x": [-5]}))));
}

#[test]
fn test_split_is_pure_and_repeatable() {
    let p = pipeline(json!([
        {"$match": {"x": {"$gte": 0}}},
        {"$group": {"_id": "$k", "total": {"$sum": "$v"}}},
        {"$sort": {"total": -1}}
    ]));
    let before = p.clone();
    let first = PipelineSplitter::split(&p).unwrap();
    let second = PipelineSplitter::split(&p).unwrap();
    assert_eq!(first, second);
    assert_eq!(p, before);

    let shard_stages: Vec<_> = first.shard_pipeline.stages().iter().map(Stage::name).collect();
    assert_eq!(shard_stages, vec!["$match", "$group"]);
    assert!(matches!(first.shard_pipeline.stages()[1], Stage::PartialGroup(_)));
    assert!(matches!(first.merge_pipeline.stages()[0], Stage::MergeGroup(_)));
    assert_eq!(first.merge_pipeline.len(), 2);
}

#[test]
fn test_count_splits_into_partial_sums() {
    let p = pipeline(json!([{"$count": "n"}]));
    let split = PipelineSplitter::split(&p).unwrap();
    assert!(matches!(split.shard_pipeline.stages(), [Stage::PartialGroup(_)]));
    assert!(matches!(split.merge_pipeline.stages(), [Stage::MergeGroup(_), Stage::Project(_)]));
}

#[test]
fn test_facet_runs_entirely_in_merge() {
    let p = pipeline(json!([
        {"$match": {"a": 1}},
        {"$facet": {"byK": [{"$group": {"_id": "$k"}}], "all": [{"$count": "n"}]}}
    ]));
    let split = PipelineSplitter::split(&p).unwrap();
    assert_eq!(split.shard_pipeline.len(), 1);
    assert!(matches!(split.merge_pipeline.stages(), [Stage::Facet(_)]));

    let nested = pipeline(json!([{"$facet": {"a": [{"$facet": {"b": []}}]}}]));
    assert!(PipelineSplitter::validate(&nested).is_err());
}

#[test]
fn test_single_target_is_passthrough_with_original_pipeline() {
    let p = pipeline(json!([{"$match": {"x": 42}}, {"$group": {"_id": null, "n": {"$sum": 1}}}]));
    let plan = DispatchPlanner::default().plan(&shards(&["s1"]), &p, &shard("s0")).unwrap();
    assert_eq!(plan.shape(), PlanShape::Passthrough);
    match plan {
        DispatchPlan::Passthrough { shard: target, pipeline } => {
            assert_eq!(target, shard("s1"));
            assert_eq!(pipeline, p);
        }
        other => panic!("expected passthrough, got {:?}", other),
    }
}

#[test]
fn test_multi_shard_plan_merges_on_router() {
    let p = pipeline(json!([{"$sort": {"x": 1}}, {"$limit": 5}]));
    let plan = DispatchPlanner::default().plan(&shards(&["s0", "s2"]), &p, &shard("s0")).unwrap();
    assert_eq!(plan.shape(), PlanShape::Split { shards: 2 });
    let DispatchPlan::Split(split) = &plan else {
        panic!("expected split plan");
    };
    assert_eq!(split.merge_host, MergeHost::Router);
    assert_eq!(split.merge_location, MergeLocation::Router);
    for (_, shard_pipeline) in plan.shard_requests() {
        assert_eq!(shard_pipeline, split.shard_pipeline);
    }

    let on_shard = DispatchPlanner::new(false).plan(&shards(&["s1", "s2"]), &p, &shard("s0")).unwrap();
    let DispatchPlan::Split(split) = on_shard else {
        panic!("expected split plan");
    };
    assert_eq!(split.merge_host, MergeHost::Shard(shard("s1")));
}

#[test]
fn test_streaming_pipeline_across_shards_has_empty_merge() {
    let p = pipeline(json!([{"$match": {"a": 1}}, {"$project": {"a": 1}}]));
    let plan = DispatchPlanner::default().plan(&shards(&["s0", "s1"]), &p, &shard("s0")).unwrap();
    let DispatchPlan::Split(split) = plan else {
        panic!("expected split plan");
    };
    assert!(split.merge_pipeline.is_empty());
    assert_eq!(split.merge_host, MergeHost::Router);
}

#[test]
fn test_output_stage_merges_on_primary() {
    let p = pipeline(json!([{"$group": {"_id": "$k"}}, {"$out": "summary"}]));

    let multi = DispatchPlanner::default().plan(&shards(&["s1", "s2"]), &p, &shard("s0")).unwrap();
    let DispatchPlan::Split(split) = &multi else {
        panic!("expected split plan");
    };
    assert_eq!(split.merge_location, MergeLocation::PrimaryShard);
    assert_eq!(split.merge_host, MergeHost::Shard(shard("s0")));
    assert!(multi.writes());

    // One data shard that is not the primary still needs a merge on the primary.
    let remote = DispatchPlanner::default().plan(&shards(&["s2"]), &p, &shard("s0")).unwrap();
    assert_eq!(remote.shape(), PlanShape::Split { shards: 1 });

    // When the only data shard is the primary, the whole pipeline runs there.
    let local = DispatchPlanner::default().plan(&shards(&["s0"]), &p, &shard("s0")).unwrap();
    assert_eq!(local.shape(), PlanShape::Passthrough);
}

#[test]
fn test_planning_is_deterministic() {
    let p = pipeline(json!([
        {"$match": {"x": {"$gte": 0}}},
        {"$group": {"_id": "$k", "n": {"$sum": 1}}},
        {"$sort": {"n": -1}}
    ]));
    let planners = [DispatchPlanner::default(), DispatchPlanner::new(false)];
    for planner in &planners {
        for targets in [shards(&["s1"]), shards(&["s2", "s0", "s1"])] {
            let first = planner.plan(&targets, &p, &shard("s0")).unwrap();
            let second = planner.plan(&targets, &p, &shard("s0")).unwrap();
            assert_eq!(first, second);
        }
    }

    // Insertion order of the target set does not pick the merge host.
    let forward = DispatchPlanner::new(false).plan(&shards(&["s1", "s2"]), &p, &shard("s0")).unwrap();
    let backward = DispatchPlanner::new(false).plan(&shards(&["s2", "s1"]), &p, &shard("s0")).unwrap();
    assert_eq!(forward, backward);
    let DispatchPlan::Split(split) = forward else {
        panic!("expected split plan");
    };
    assert_eq!(split.merge_host, MergeHost::Shard(shard("s1")));
}

#[test]
fn test_empty_target_set_is_a_planning_error() {
    let p = pipeline(json!([]));
    let err = DispatchPlanner::default().plan(&BTreeSet::new(), &p, &shard("s0")).unwrap_err();
    assert!(matches!(err, shardagg::RouterError::PlanningError(_)));
}
