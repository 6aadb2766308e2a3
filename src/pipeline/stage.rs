use std::cmp::Ordering;
use std::fmt;

use serde_json::{Value, json};

use super::filter::validate_filter;
use crate::core::value::{compare_values, get_path};
use crate::core::{Document, Namespace, Result, RouterError};
use crate::evaluator::Expr;

// ============================================================================
// Stage payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
    /// Compares two documents; missing fields sort as `null`.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (path, direction) in &self.keys {
            let left = get_path(a, path).unwrap_or(&Value::Null);
            let right = get_path(b, path).unwrap_or(&Value::Null);
            let ord = match direction {
                SortDirection::Ascending => compare_values(left, right),
                SortDirection::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Push(Expr),
    AddToSet(Expr),
    Count,
}

impl Accumulator {
    fn parse(output: &str, spec: &Value) -> Result<Self> {
        let obj = spec.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
            RouterError::ParseError(format!(
                "The field '{}' must be an accumulator object",
                output
            ))
        })?;
        let Some((op, arg)) = obj.iter().next() else {
            return Err(RouterError::ParseError(format!("empty accumulator for '{}'", output)));
        };
        let expr = || Expr::parse(arg);
        Ok(match op.as_str() {
            "$sum" => Self::Sum(expr()?),
            "$avg" => Self::Avg(expr()?),
            "$min" => Self::Min(expr()?),
            "$max" => Self::Max(expr()?),
            "$first" => Self::First(expr()?),
            "$last" => Self::Last(expr()?),
            "$push" => Self::Push(expr()?),
            "$addToSet" => Self::AddToSet(expr()?),
            "$count" => Self::Count,
            other => {
                return Err(RouterError::ParseError(format!(
                    "unknown group operator '{}'",
                    other
                )));
            }
        })
    }

    pub fn operator(&self) -> &'static str {
        match self {
            Self::Sum(_) => "$sum",
            Self::Avg(_) => "$avg",
            Self::Min(_) => "$min",
            Self::Max(_) => "$max",
            Self::First(_) => "$first",
            Self::Last(_) => "$last",
            Self::Push(_) => "$push",
            Self::AddToSet(_) => "$addToSet",
            Self::Count => "$count",
        }
    }

    pub fn argument(&self) -> Option<&Expr> {
        match self {
            Self::Sum(e)
            | Self::Avg(e)
            | Self::Min(e)
            | Self::Max(e)
            | Self::First(e)
            | Self::Last(e)
            | Self::Push(e)
            | Self::AddToSet(e) => Some(e),
            Self::Count => None,
        }
    }

    fn to_json(&self) -> Value {
        let arg = self.argument().map(Expr::to_json).unwrap_or_else(|| json!({}));
        json!({ self.operator(): arg })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSpec {
    pub output: String,
    pub accumulator: Accumulator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub id: Expr,
    pub accumulators: Vec<AccumulatorSpec>,
}

impl GroupSpec {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RouterError::ParseError("a group's fields must be specified in an object".into()))?;
        let id = obj
            .get("_id")
            .ok_or_else(|| RouterError::ParseError("a group specification must include an _id".into()))?;
        let mut accumulators = Vec::new();
        for (output, spec) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
            if output.starts_with('$') || output.contains('.') {
                return Err(RouterError::ParseError(format!(
                    "the group aggregate field name '{}' cannot be an operator name or contain a '.'",
                    output
                )));
            }
            accumulators.push(AccumulatorSpec {
                output: output.clone(),
                accumulator: Accumulator::parse(output, spec)?,
            });
        }
        Ok(Self {
            id: Expr::parse(id)?,
            accumulators,
        })
    }

    /// `$count: field` as a group: `{_id: null, field: {$sum: 1}}`.
    pub fn counting(field: &str) -> Self {
        Self {
            id: Expr::Literal(Value::Null),
            accumulators: vec![AccumulatorSpec {
                output: field.to_string(),
                accumulator: Accumulator::Sum(Expr::literal(1)),
            }],
        }
    }

    fn to_json(&self) -> Document {
        let mut obj = Document::new();
        obj.insert("_id".into(), self.id.to_json());
        for acc in &self.accumulators {
            obj.insert(acc.output.clone(), acc.accumulator.to_json());
        }
        obj
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectSpec {
    /// Listed paths kept (or computed); `_id` kept unless excluded.
    Include {
        fields: Vec<(String, Option<Expr>)>,
        exclude_id: bool,
    },
    Exclude(Vec<String>),
}

impl ProjectSpec {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| RouterError::ParseError("$project specification must be a nonempty object".into()))?;

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut exclude_id = false;
        for (path, spec) in obj {
            match spec {
                Value::Bool(flag) => {
                    flag_field(path, *flag, &mut included, &mut excluded, &mut exclude_id)
                }
                Value::Number(n) => {
                    let flag = n.as_f64().is_some_and(|f| f != 0.0);
                    flag_field(path, flag, &mut included, &mut excluded, &mut exclude_id)
                }
                other => included.push((path.clone(), Some(Expr::parse(other)?))),
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(RouterError::ParseError(
                "Cannot do exclusion and inclusion in the same projection".into(),
            ));
        }
        if included.is_empty() {
            if exclude_id {
                excluded.push("_id".to_string());
            }
            return Ok(Self::Exclude(excluded));
        }
        Ok(Self::Include {
            fields: included,
            exclude_id,
        })
    }

    fn to_json(&self) -> Value {
        let mut obj = Document::new();
        match self {
            Self::Include { fields, exclude_id } => {
                if *exclude_id {
                    obj.insert("_id".into(), json!(0));
                }
                for (path, expr) in fields {
                    let spec = expr.as_ref().map(Expr::to_json).unwrap_or_else(|| json!(1));
                    obj.insert(path.clone(), spec);
                }
            }
            Self::Exclude(paths) => {
                for path in paths {
                    obj.insert(path.clone(), json!(0));
                }
            }
        }
        Value::Object(obj)
    }
}

fn flag_field(
    path: &str,
    flag: bool,
    included: &mut Vec<(String, Option<Expr>)>,
    excluded: &mut Vec<String>,
    exclude_id: &mut bool,
) {
    match (path, flag) {
        ("_id", false) => *exclude_id = true,
        ("_id", true) => {}
        (_, true) => included.push((path.to_string(), None)),
        (_, false) => excluded.push(path.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindSpec {
    pub path: String,
    pub preserve_null_and_empty: bool,
}

impl UnwindSpec {
    fn parse(value: &Value) -> Result<Self> {
        let (raw, preserve) = match value {
            Value::String(s) => (s.as_str(), false),
            Value::Object(obj) => {
                let path = obj.get("path").and_then(Value::as_str).ok_or_else(|| {
                    RouterError::ParseError("$unwind requires a 'path' string".into())
                })?;
                let preserve = obj
                    .get("preserveNullAndEmptyArrays")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                (path, preserve)
            }
            _ => {
                return Err(RouterError::ParseError(
                    "$unwind expects a string or an object".into(),
                ));
            }
        };
        let path = raw.strip_prefix('$').filter(|p| !p.is_empty()).ok_or_else(|| {
            RouterError::ParseError(format!("$unwind path '{}' must be prefixed with '$'", raw))
        })?;
        Ok(Self {
            path: path.to_string(),
            preserve_null_and_empty: preserve,
        })
    }
}

/// Destination collection of `$out` / `$merge`; a bare name stays in the source db.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub db: Option<String>,
    pub collection: String,
}

impl OutputTarget {
    fn parse(stage: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(coll) if !coll.is_empty() => Ok(Self {
                db: None,
                collection: coll.clone(),
            }),
            Value::Object(obj) => {
                let collection = obj
                    .get("coll")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RouterError::ParseError(format!("{} requires 'coll'", stage)))?;
                Ok(Self {
                    db: obj.get("db").and_then(Value::as_str).map(str::to_string),
                    collection: collection.to_string(),
                })
            }
            _ => Err(RouterError::ParseError(format!(
                "{} expects a collection name or {{db, coll}}",
                stage
            ))),
        }
    }

    pub fn resolve(&self, source: &Namespace) -> Result<Namespace> {
        match &self.db {
            Some(db) => Namespace::new(db.clone(), self.collection.clone()),
            None => source.sibling(&self.collection),
        }
    }

    fn to_json(&self) -> Value {
        match &self.db {
            Some(db) => json!({ "db": db, "coll": self.collection }),
            None => Value::String(self.collection.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub into: OutputTarget,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

impl MergeSpec {
    fn parse(value: &Value) -> Result<Self> {
        let obj = match value {
            Value::String(_) => {
                return Ok(Self {
                    into: OutputTarget::parse("$merge", value)?,
                    on: vec!["_id".into()],
                    when_matched: WhenMatched::Merge,
                    when_not_matched: WhenNotMatched::Insert,
                });
            }
            Value::Object(obj) => obj,
            _ => return Err(RouterError::ParseError("$merge expects a string or an object".into())),
        };
        let into = obj
            .get("into")
            .ok_or_else(|| RouterError::ParseError("$merge requires 'into'".into()))?;
        let on = match obj.get("on") {
            None => vec!["_id".to_string()],
            Some(Value::String(field)) => vec![field.clone()],
            Some(Value::Array(fields)) => fields
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| RouterError::ParseError("$merge 'on' must list field names".into()))
                })
                .collect::<Result<_>>()?,
            Some(_) => return Err(RouterError::ParseError("$merge 'on' must be a string or array".into())),
        };
        let when_matched = match obj.get("whenMatched").and_then(Value::as_str) {
            None | Some("merge") => WhenMatched::Merge,
            Some("replace") => WhenMatched::Replace,
            Some("keepExisting") => WhenMatched::KeepExisting,
            Some("fail") => WhenMatched::Fail,
            Some(other) => {
                return Err(RouterError::ParseError(format!(
                    "unsupported $merge whenMatched mode '{}'",
                    other
                )));
            }
        };
        let when_not_matched = match obj.get("whenNotMatched").and_then(Value::as_str) {
            None | Some("insert") => WhenNotMatched::Insert,
            Some("discard") => WhenNotMatched::Discard,
            Some("fail") => WhenNotMatched::Fail,
            Some(other) => {
                return Err(RouterError::ParseError(format!(
                    "unsupported $merge whenNotMatched mode '{}'",
                    other
                )));
            }
        };
        Ok(Self {
            into: OutputTarget::parse("$merge", into)?,
            on,
            when_matched,
            when_not_matched,
        })
    }

    fn to_json(&self) -> Value {
        let when_matched = match self.when_matched {
            WhenMatched::Replace => "replace",
            WhenMatched::KeepExisting => "keepExisting",
            WhenMatched::Merge => "merge",
            WhenMatched::Fail => "fail",
        };
        let when_not_matched = match self.when_not_matched {
            WhenNotMatched::Insert => "insert",
            WhenNotMatched::Discard => "discard",
            WhenNotMatched::Fail => "fail",
        };
        json!({
            "into": self.into.to_json(),
            "on": self.on,
            "whenMatched": when_matched,
            "whenNotMatched": when_not_matched,
        })
    }
}

// ============================================================================
// Stage
// ============================================================================

/// How a stage behaves when the collection is spread over several shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Runs per document on each shard.
    Streaming,
    /// Partial form on shards, finalizer on the merger.
    Dual,
    /// Needs the whole input, runs on the merger only.
    MergeOnly,
    /// Materializes output; must run on the primary shard.
    PrimaryOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Document),
    Project(ProjectSpec),
    AddFields(Vec<(String, Expr)>),
    Unset(Vec<String>),
    Unwind(UnwindSpec),
    Sort(SortSpec),
    Limit(u64),
    Skip(u64),
    Group(GroupSpec),
    /// Shard half of a split `$group`: emits per-key partial state.
    PartialGroup(GroupSpec),
    /// Merge half of a split `$group`: combines partial state and finalizes.
    MergeGroup(GroupSpec),
    Count(String),
    Facet(Vec<(String, Pipeline)>),
    Out(OutputTarget),
    Merge(MergeSpec),
}

impl Stage {
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
            RouterError::ParseError(
                "A pipeline stage specification object must contain exactly one field".into(),
            )
        })?;
        let Some((name, spec)) = obj.iter().next() else {
            return Err(RouterError::ParseError("empty pipeline stage".into()));
        };

        match name.as_str() {
            "$match" => {
                let filter = spec
                    .as_object()
                    .ok_or_else(|| RouterError::ParseError("the match filter must be an expression in an object".into()))?;
                validate_filter(filter)?;
                Ok(Self::Match(filter.clone()))
            }
            "$project" => Ok(Self::Project(ProjectSpec::parse(spec)?)),
            "$addFields" | "$set" => {
                let obj = spec
                    .as_object()
                    .ok_or_else(|| RouterError::ParseError(format!("{} specification must be an object", name)))?;
                let fields = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                    .collect::<Result<_>>()?;
                Ok(Self::AddFields(fields))
            }
            "$unset" => {
                let paths = match spec {
                    Value::String(path) => vec![path.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|item| {
                            item.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| RouterError::ParseError("$unset specification must be a string or an array of strings".into()))
                        })
                        .collect::<Result<_>>()?,
                    _ => {
                        return Err(RouterError::ParseError(
                            "$unset specification must be a string or an array".into(),
                        ));
                    }
                };
                Ok(Self::Unset(paths))
            }
            "$unwind" => Ok(Self::Unwind(UnwindSpec::parse(spec)?)),
            "$sort" => {
                let obj = spec
                    .as_object()
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| RouterError::ParseError("$sort key specification must be a nonempty object".into()))?;
                let keys = obj
                    .iter()
                    .map(|(path, dir)| match dir.as_i64() {
                        Some(1) => Ok((path.clone(), SortDirection::Ascending)),
                        Some(-1) => Ok((path.clone(), SortDirection::Descending)),
                        _ => Err(RouterError::ParseError(format!(
                            "$sort key ordering must be 1 (for ascending) or -1 (for descending), got {}",
                            dir
                        ))),
                    })
                    .collect::<Result<_>>()?;
                Ok(Self::Sort(SortSpec { keys }))
            }
            "$limit" => match spec.as_u64() {
                Some(n) if n > 0 => Ok(Self::Limit(n)),
                _ => Err(RouterError::ParseError("the limit must be positive".into())),
            },
            "$skip" => spec
                .as_u64()
                .map(Self::Skip)
                .ok_or_else(|| RouterError::ParseError("the skip must be a non-negative integer".into())),
            "$group" => Ok(Self::Group(GroupSpec::parse(spec)?)),
            "$count" => match spec.as_str() {
                Some(field) if !field.is_empty() && !field.starts_with('$') && !field.contains('.') => {
                    Ok(Self::Count(field.to_string()))
                }
                _ => Err(RouterError::ParseError(
                    "the count field must be a non-empty string without '$' or '.'".into(),
                )),
            },
            "$facet" => {
                let obj = spec
                    .as_object()
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| RouterError::ParseError("$facet requires a nonempty object".into()))?;
                let facets = obj
                    .iter()
                    .map(|(name, pipeline)| Ok((name.clone(), Pipeline::parse(pipeline)?)))
                    .collect::<Result<_>>()?;
                Ok(Self::Facet(facets))
            }
            "$out" => Ok(Self::Out(OutputTarget::parse("$out", spec)?)),
            "$merge" => Ok(Self::Merge(MergeSpec::parse(spec)?)),
            other => Err(RouterError::ParseError(format!(
                "Unrecognized pipeline stage name: '{}'",
                other
            ))),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Self::Match(_) | Self::Project(_) | Self::AddFields(_) | Self::Unset(_) | Self::Unwind(_) => {
                StageKind::Streaming
            }
            Self::Sort(_) | Self::Limit(_) | Self::Group(_) | Self::Count(_) => StageKind::Dual,
            Self::Skip(_) | Self::Facet(_) | Self::PartialGroup(_) | Self::MergeGroup(_) => {
                StageKind::MergeOnly
            }
            Self::Out(_) | Self::Merge(_) => StageKind::PrimaryOnly,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Match(_) => "$match",
            Self::Project(_) => "$project",
            Self::AddFields(_) => "$addFields",
            Self::Unset(_) => "$unset",
            Self::Unwind(_) => "$unwind",
            Self::Sort(_) => "$sort",
            Self::Limit(_) => "$limit",
            Self::Skip(_) => "$skip",
            Self::Group(_) | Self::PartialGroup(_) | Self::MergeGroup(_) => "$group",
            Self::Count(_) => "$count",
            Self::Facet(_) => "$facet",
            Self::Out(_) => "$out",
            Self::Merge(_) => "$merge",
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind() == StageKind::PrimaryOnly
    }

    pub fn to_json(&self) -> Value {
        let spec = match self {
            Self::Match(filter) => Value::Object(filter.clone()),
            Self::Project(spec) => spec.to_json(),
            Self::AddFields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.to_json()))
                    .collect(),
            ),
            Self::Unset(paths) => json!(paths),
            Self::Unwind(spec) => json!({
                "path": format!("${}", spec.path),
                "preserveNullAndEmptyArrays": spec.preserve_null_and_empty,
            }),
            Self::Sort(spec) => Value::Object(
                spec.keys
                    .iter()
                    .map(|(path, dir)| {
                        let dir = match dir {
                            SortDirection::Ascending => 1,
                            SortDirection::Descending => -1,
                        };
                        (path.clone(), json!(dir))
                    })
                    .collect(),
            ),
            Self::Limit(n) | Self::Skip(n) => json!(n),
            Self::Group(spec) | Self::PartialGroup(spec) => Value::Object(spec.to_json()),
            Self::MergeGroup(spec) => {
                let mut obj = spec.to_json();
                obj.insert("$doingMerge".into(), Value::Bool(true));
                Value::Object(obj)
            }
            Self::Count(field) => json!(field),
            Self::Facet(facets) => Value::Object(
                facets
                    .iter()
                    .map(|(name, pipeline)| (name.clone(), pipeline.to_json()))
                    .collect(),
            ),
            Self::Out(target) => target.to_json(),
            Self::Merge(spec) => spec.to_json(),
        };
        json!({ self.name(): spec })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Ordered, immutable list of stages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| RouterError::ParseError("a pipeline must be an array of stages".into()))?;
        Ok(Self {
            stages: items.iter().map(Stage::parse).collect::<Result<_>>()?,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RouterError::ParseError(format!("invalid pipeline JSON: {}", e)))?;
        Self::parse(&value)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Conjunction of the `$match` stages at the front of the pipeline.
    pub fn leading_filter(&self) -> Option<Document> {
        let filters: Vec<&Document> = self
            .stages
            .iter()
            .map_while(|stage| match stage {
                Stage::Match(filter) => Some(filter),
                _ => None,
            })
            .collect();
        match filters.as_slice() {
            [] => None,
            [single] => Some((*single).clone()),
            many => {
                let mut and = Document::new();
                and.insert(
                    "$and".into(),
                    Value::Array(many.iter().map(|f| Value::Object((*f).clone())).collect()),
                );
                Some(and)
            }
        }
    }

    pub fn has_write_stage(&self) -> bool {
        self.stages.iter().any(Stage::is_write)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_json).collect())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
