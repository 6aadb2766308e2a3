//! Local pipeline execution over an in-memory batch of documents.
//!
//! Shards run their half here; the router runs merge pipelines here when it
//! is the merge host.

use serde_json::Value;

use super::filter;
use super::group::{GroupMode, run_group};
use super::stage::{GroupSpec, MergeSpec, Pipeline, ProjectSpec, Stage, UnwindSpec, WhenMatched, WhenNotMatched};
use crate::core::value::{get_path, remove_path, set_path, values_equal};
use crate::core::{Document, Namespace, Result, RouterError};
use crate::evaluator;

/// Destination for `$out` / `$merge`.
pub trait OutputSink: Send + Sync {
    /// Atomically replaces the contents of `target`.
    fn replace_collection(&self, target: &Namespace, docs: Vec<Document>) -> Result<()>;

    /// Merges `docs` into `target` according to `spec`.
    fn merge_into(&self, target: &Namespace, docs: Vec<Document>, spec: &MergeSpec) -> Result<()>;
}

/// Sink for contexts that never materialize output.
pub struct NoOutput;

impl OutputSink for NoOutput {
    fn replace_collection(&self, target: &Namespace, _docs: Vec<Document>) -> Result<()> {
        Err(RouterError::ExecutionError(format!(
            "$out to {} is not allowed here",
            target
        )))
    }

    fn merge_into(&self, target: &Namespace, _docs: Vec<Document>, _spec: &MergeSpec) -> Result<()> {
        Err(RouterError::ExecutionError(format!(
            "$merge into {} is not allowed here",
            target
        )))
    }
}

pub struct ExecContext<'a> {
    pub namespace: &'a Namespace,
    pub sink: &'a dyn OutputSink,
}

impl<'a> ExecContext<'a> {
    pub fn new(namespace: &'a Namespace, sink: &'a dyn OutputSink) -> Self {
        Self { namespace, sink }
    }
}

pub fn run_pipeline(pipeline: &Pipeline, input: Vec<Document>, ctx: &ExecContext<'_>) -> Result<Vec<Document>> {
    pipeline
        .stages()
        .iter()
        .try_fold(input, |docs, stage| run_stage(stage, docs, ctx))
}

fn run_stage(stage: &Stage, docs: Vec<Document>, ctx: &ExecContext<'_>) -> Result<Vec<Document>> {
    match stage {
        Stage::Match(f) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                if filter::matches(f, &doc)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        Stage::Project(spec) => docs.into_iter().map(|doc| project(spec, doc)).collect(),
        Stage::AddFields(fields) => docs
            .into_iter()
            .map(|mut doc| {
                let computed = fields
                    .iter()
                    .map(|(path, expr)| Ok((path, evaluator::evaluate(expr, &doc)?)))
                    .collect::<Result<Vec<_>>>()?;
                for (path, value) in computed {
                    set_path(&mut doc, path, value);
                }
                Ok(doc)
            })
            .collect(),
        Stage::Unset(paths) => Ok(docs
            .into_iter()
            .map(|mut doc| {
                for path in paths {
                    remove_path(&mut doc, path);
                }
                doc
            })
            .collect()),
        Stage::Unwind(spec) => Ok(docs.into_iter().flat_map(|doc| unwind(spec, doc)).collect()),
        Stage::Sort(spec) => {
            let mut docs = docs;
            docs.sort_by(|a, b| spec.compare(a, b));
            Ok(docs)
        }
        Stage::Limit(n) => Ok(docs.into_iter().take(clamp(*n)).collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(clamp(*n)).collect()),
        Stage::Group(spec) => run_group(spec, GroupMode::Full, docs),
        Stage::PartialGroup(spec) => run_group(spec, GroupMode::Partial, docs),
        Stage::MergeGroup(spec) => run_group(spec, GroupMode::Merge, docs),
        Stage::Count(field) => {
            let grouped = run_group(&GroupSpec::counting(field), GroupMode::Full, docs)?;
            Ok(grouped
                .into_iter()
                .map(|mut doc| {
                    doc.remove("_id");
                    doc
                })
                .collect())
        }
        Stage::Facet(facets) => {
            let mut out = Document::new();
            for (name, pipeline) in facets {
                let results = run_pipeline(pipeline, docs.clone(), ctx)?;
                out.insert(
                    name.clone(),
                    Value::Array(results.into_iter().map(Value::Object).collect()),
                );
            }
            Ok(vec![out])
        }
        Stage::Out(target) => {
            ctx.sink.replace_collection(&target.resolve(ctx.namespace)?, docs)?;
            Ok(Vec::new())
        }
        Stage::Merge(spec) => {
            ctx.sink.merge_into(&spec.into.resolve(ctx.namespace)?, docs, spec)?;
            Ok(Vec::new())
        }
    }
}

fn clamp(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn project(spec: &ProjectSpec, doc: Document) -> Result<Document> {
    match spec {
        ProjectSpec::Exclude(paths) => {
            let mut doc = doc;
            for path in paths {
                remove_path(&mut doc, path);
            }
            Ok(doc)
        }
        ProjectSpec::Include { fields, exclude_id } => {
            let mut out = Document::new();
            if !exclude_id {
                if let Some(id) = doc.get("_id") {
                    out.insert("_id".into(), id.clone());
                }
            }
            for (path, expr) in fields {
                let value = match expr {
                    None => get_path(&doc, path).cloned(),
                    Some(expr) => evaluator::evaluate_optional(expr, &doc)?,
                };
                if let Some(value) = value {
                    set_path(&mut out, path, value);
                }
            }
            Ok(out)
        }
    }
}

fn unwind(spec: &UnwindSpec, doc: Document) -> Vec<Document> {
    match get_path(&doc, &spec.path).cloned() {
        Some(Value::Array(items)) if !items.is_empty() => items
            .into_iter()
            .map(|item| {
                let mut copy = doc.clone();
                set_path(&mut copy, &spec.path, item);
                copy
            })
            .collect(),
        Some(Value::Array(_)) => {
            if spec.preserve_null_and_empty {
                let mut copy = doc;
                remove_path(&mut copy, &spec.path);
                vec![copy]
            } else {
                Vec::new()
            }
        }
        None | Some(Value::Null) => {
            if spec.preserve_null_and_empty {
                vec![doc]
            } else {
                Vec::new()
            }
        }
        Some(_) => vec![doc],
    }
}

/// Applies `$merge` semantics to an existing collection.
pub fn apply_merge(existing: &mut Vec<Document>, incoming: Vec<Document>, spec: &MergeSpec) -> Result<()> {
    for doc in incoming {
        let key: Vec<Value> = spec
            .on
            .iter()
            .map(|field| get_path(&doc, field).cloned().unwrap_or(Value::Null))
            .collect();
        let position = existing.iter().position(|candidate| {
            spec.on.iter().zip(&key).all(|(field, value)| {
                values_equal(get_path(candidate, field).unwrap_or(&Value::Null), value)
            })
        });

        match (position, spec.when_matched, spec.when_not_matched) {
            (Some(idx), WhenMatched::Replace, _) => existing[idx] = doc,
            (Some(_), WhenMatched::KeepExisting, _) => {}
            (Some(idx), WhenMatched::Merge, _) => {
                for (field, value) in doc {
                    existing[idx].insert(field, value);
                }
            }
            (Some(_), WhenMatched::Fail, _) => {
                return Err(RouterError::ExecutionError(format!(
                    "$merge found an existing document with the same {:?}",
                    spec.on
                )));
            }
            (None, _, WhenNotMatched::Insert) => existing.push(doc),
            (None, _, WhenNotMatched::Discard) => {}
            (None, _, WhenNotMatched::Fail) => {
                return Err(RouterError::ExecutionError(
                    "$merge could not find a matching document in the target collection".into(),
                ));
            }
        }
    }
    Ok(())
}
