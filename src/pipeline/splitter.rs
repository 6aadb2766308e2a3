use serde::{Deserialize, Serialize};

use super::stage::{GroupSpec, Pipeline, ProjectSpec, Stage, StageKind};
use crate::core::{Result, RouterError};

/// Where the merge half of a split pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeLocation {
    /// No preference; any participating shard or the router.
    AnyShard,
    /// Forced onto the collection's primary shard.
    PrimaryShard,
    Router,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitResult {
    pub shard_pipeline: Pipeline,
    pub merge_pipeline: Pipeline,
    pub merge_location: MergeLocation,
}

/// Divides a pipeline into a shard-local prefix and a merge-time suffix.
pub struct PipelineSplitter;

impl PipelineSplitter {
    /// Shape checks that must fail before anything is dispatched.
    pub fn validate(pipeline: &Pipeline) -> Result<()> {
        Self::validate_inner(pipeline, false)
    }

    fn validate_inner(pipeline: &Pipeline, nested_in_facet: bool) -> Result<()> {
        let stages = pipeline.stages();
        for (idx, stage) in stages.iter().enumerate() {
            match stage {
                Stage::Out(_) | Stage::Merge(_) if nested_in_facet => {
                    return Err(RouterError::PlanningError(format!(
                        "{} is not allowed within a $facet stage",
                        stage.name()
                    )));
                }
                Stage::Out(_) | Stage::Merge(_) if idx + 1 != stages.len() => {
                    return Err(RouterError::PlanningError(format!(
                        "{} can only be the final stage in the pipeline",
                        stage.name()
                    )));
                }
                Stage::Facet(_) if nested_in_facet => {
                    return Err(RouterError::PlanningError(
                        "$facet is not allowed to be used within a $facet stage".into(),
                    ));
                }
                Stage::Facet(facets) => {
                    for (_, nested) in facets {
                        Self::validate_inner(nested, true)?;
                    }
                }
                Stage::PartialGroup(_) | Stage::MergeGroup(_) => {
                    return Err(RouterError::PlanningError(
                        "internal $group forms cannot appear in a user pipeline".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Splits `pipeline` at its first stage that cannot run independently per shard.
    ///
    /// Never mutates the input. A pipeline of streaming stages only yields an
    /// empty merge half.
    pub fn split(pipeline: &Pipeline) -> Result<SplitResult> {
        Self::validate(pipeline)?;

        let stages = pipeline.stages();
        let boundary = stages
            .iter()
            .position(|stage| stage.kind() != StageKind::Streaming)
            .unwrap_or(stages.len());

        let mut shard: Vec<Stage> = stages[..boundary].to_vec();
        let mut merge: Vec<Stage> = Vec::new();
        let tail = &stages[boundary..];

        if let Some(first) = tail.first() {
            let rest = &tail[1..];
            match first {
                Stage::Sort(spec) => {
                    shard.push(Stage::Sort(spec.clone()));
                    // sort + limit: each shard only needs its own top k.
                    if let Some(Stage::Limit(n)) = rest.first() {
                        shard.push(Stage::Limit(*n));
                    }
                    merge.push(first.clone());
                    merge.extend_from_slice(rest);
                }
                Stage::Limit(n) => {
                    shard.push(Stage::Limit(*n));
                    merge.push(Stage::Limit(*n));
                    merge.extend_from_slice(rest);
                }
                Stage::Group(spec) => {
                    shard.push(Stage::PartialGroup(spec.clone()));
                    merge.push(Stage::MergeGroup(spec.clone()));
                    merge.extend_from_slice(rest);
                }
                Stage::Count(field) => {
                    let spec = GroupSpec::counting(field);
                    shard.push(Stage::PartialGroup(spec.clone()));
                    merge.push(Stage::MergeGroup(spec));
                    merge.push(Stage::Project(ProjectSpec::Include {
                        fields: vec![(field.clone(), None)],
                        exclude_id: true,
                    }));
                    merge.extend_from_slice(rest);
                }
                _ => merge.extend_from_slice(tail),
            }
        }

        let merge_location = if merge.iter().any(Stage::is_write) {
            MergeLocation::PrimaryShard
        } else {
            MergeLocation::AnyShard
        };

        Ok(SplitResult {
            shard_pipeline: Pipeline::new(shard),
            merge_pipeline: Pipeline::new(merge),
            merge_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(value: serde_json::Value) -> Pipeline {
        Pipeline::parse(&value).unwrap()
    }

    #[test]
    fn streaming_only_pipeline_has_no_merge_half() {
        let p = pipeline(json!([{"$match": {"a": 1}}, {"$project": {"a": 1}}]));
        let split = PipelineSplitter::split(&p).unwrap();
        assert_eq!(split.shard_pipeline, p);
        assert!(split.merge_pipeline.is_empty());
    }

    #[test]
    fn sort_followed_by_limit_pushes_top_k_to_shards() {
        let p = pipeline(json!([{"$match": {"a": 1}}, {"$sort": {"b": -1}}, {"$limit": 3}, {"$skip": 1}]));
        let split = PipelineSplitter::split(&p).unwrap();
        let shard: Vec<_> = split.shard_pipeline.stages().iter().map(Stage::name).collect();
        let merge: Vec<_> = split.merge_pipeline.stages().iter().map(Stage::name).collect();
        assert_eq!(shard, vec!["$match", "$sort", "$limit"]);
        assert_eq!(merge, vec!["$sort", "$limit", "$skip"]);
        assert_eq!(split.merge_location, MergeLocation::AnyShard);
    }

    #[test]
    fn group_splits_into_partial_and_merging_forms() {
        let p = pipeline(json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]));
        let split = PipelineSplitter::split(&p).unwrap();
        assert!(matches!(split.shard_pipeline.stages(), [Stage::PartialGroup(_)]));
        assert!(matches!(split.merge_pipeline.stages(), [Stage::MergeGroup(_)]));
        assert_eq!(
            split.merge_pipeline.to_json()[0]["$group"]["$doingMerge"],
            json!(true)
        );
    }

    #[test]
    fn output_stage_forces_primary_merge() {
        let p = pipeline(json!([{"$match": {"a": 1}}, {"$out": "results"}]));
        let split = PipelineSplitter::split(&p).unwrap();
        assert_eq!(split.merge_location, MergeLocation::PrimaryShard);
        assert_eq!(split.merge_pipeline.len(), 1);
    }

    #[test]
    fn misplaced_output_stages_are_planning_errors() {
        let not_last = pipeline(json!([{"$out": "x"}, {"$match": {}}]));
        assert!(matches!(
            PipelineSplitter::split(&not_last),
            Err(RouterError::PlanningError(_))
        ));

        let in_facet = pipeline(json!([{"$facet": {"a": [{"$merge": {"into": "x"}}]}}]));
        assert!(matches!(
            PipelineSplitter::validate(&in_facet),
            Err(RouterError::PlanningError(_))
        ));
    }
}
