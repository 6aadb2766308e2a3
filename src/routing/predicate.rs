use std::cmp::Ordering;

use serde_json::Value;

use super::chunk::{ChunkRange, KeyBound};
use crate::core::Document;

/// Contiguous interval of shard-key values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInterval {
    pub min: KeyBound,
    pub min_inclusive: bool,
    pub max: KeyBound,
    pub max_inclusive: bool,
}

impl KeyInterval {
    pub fn full() -> Self {
        Self {
            min: KeyBound::MinKey,
            min_inclusive: true,
            max: KeyBound::MaxKey,
            max_inclusive: true,
        }
    }

    pub fn point(value: Value) -> Self {
        let bound = KeyBound::Value(value);
        Self {
            min: bound.clone(),
            min_inclusive: true,
            max: bound,
            max_inclusive: true,
        }
    }

    fn lower(value: Value, inclusive: bool) -> Self {
        Self {
            min: KeyBound::Value(value),
            min_inclusive: inclusive,
            ..Self::full()
        }
    }

    fn upper(value: Value, inclusive: bool) -> Self {
        Self {
            max: KeyBound::Value(value),
            max_inclusive: inclusive,
            ..Self::full()
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.min.cmp(&self.max) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.min_inclusive && self.max_inclusive),
            Ordering::Less => false,
        }
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let (min, min_inclusive) = match self.min.cmp(&other.min) {
            Ordering::Greater => (self.min.clone(), self.min_inclusive),
            Ordering::Less => (other.min.clone(), other.min_inclusive),
            Ordering::Equal => (self.min.clone(), self.min_inclusive && other.min_inclusive),
        };
        let (max, max_inclusive) = match self.max.cmp(&other.max) {
            Ordering::Less => (self.max.clone(), self.max_inclusive),
            Ordering::Greater => (other.max.clone(), other.max_inclusive),
            Ordering::Equal => (self.max.clone(), self.max_inclusive && other.max_inclusive),
        };
        Self {
            min,
            min_inclusive,
            max,
            max_inclusive,
        }
    }

    /// Whether any key of this interval falls into the half-open chunk.
    pub fn overlaps(&self, chunk: &ChunkRange) -> bool {
        if self.is_empty() {
            return false;
        }
        let below_chunk_max = self.min < chunk.max || chunk.max == KeyBound::MaxKey;
        let above_chunk_min = if self.max_inclusive {
            self.max >= chunk.min
        } else {
            self.max > chunk.min
        };
        below_chunk_max && above_chunk_min
    }
}

/// Union of key intervals a filter can match. No intervals = matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPredicate {
    intervals: Vec<KeyInterval>,
}

impl KeyPredicate {
    pub fn new(intervals: Vec<KeyInterval>) -> Self {
        Self {
            intervals: intervals.into_iter().filter(|i| !i.is_empty()).collect(),
        }
    }

    pub fn intervals(&self) -> &[KeyInterval] {
        &self.intervals
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.intervals.is_empty()
    }

    fn intersect(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        for left in &self.intervals {
            for right in &other.intervals {
                out.push(left.intersect(right));
            }
        }
        Self::new(out)
    }

    fn union(mut self, other: Self) -> Self {
        self.intervals.extend(other.intervals);
        self
    }
}

/// Intersection where `None` means "unconstrained".
fn conjoin(acc: Option<KeyPredicate>, next: Option<KeyPredicate>) -> Option<KeyPredicate> {
    match (acc, next) {
        (None, other) | (other, None) => other,
        (Some(a), Some(b)) => Some(a.intersect(&b)),
    }
}

/// Extracts the constraint a `$match` filter places on `field`.
///
/// Returns `None` when the filter does not restrict the field at all.
pub fn extract_key_predicate(filter: &Document, field: &str) -> Option<KeyPredicate> {
    let mut acc = None;
    for (key, value) in filter {
        let clause = match key.as_str() {
            "$and" => value.as_array().and_then(|branches| {
                branches
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|branch| extract_key_predicate(branch, field))
                    .fold(None, conjoin)
            }),
            "$or" => value.as_array().and_then(|branches| extract_or(branches, field)),
            k if k == field => field_predicate(value),
            _ => None,
        };
        acc = conjoin(acc, clause);
    }
    acc
}

fn extract_or(branches: &[Value], field: &str) -> Option<KeyPredicate> {
    let mut union = KeyPredicate::new(Vec::new());
    for branch in branches {
        let Some(branch) = branch.as_object() else {
            return None;
        };
        // One unconstrained branch makes the whole disjunction unconstrained.
        union = union.union(extract_key_predicate(branch, field)?);
    }
    Some(union)
}

fn is_operator_document(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')))
}

fn field_predicate(value: &Value) -> Option<KeyPredicate> {
    if !is_operator_document(value) {
        return Some(KeyPredicate::new(vec![KeyInterval::point(value.clone())]));
    }

    let ops = value.as_object()?;
    let mut acc = None;
    for (op, arg) in ops {
        let clause = match op.as_str() {
            "$eq" => Some(KeyPredicate::new(vec![KeyInterval::point(arg.clone())])),
            "$gt" => Some(KeyPredicate::new(vec![KeyInterval::lower(arg.clone(), false)])),
            "$gte" => Some(KeyPredicate::new(vec![KeyInterval::lower(arg.clone(), true)])),
            "$lt" => Some(KeyPredicate::new(vec![KeyInterval::upper(arg.clone(), false)])),
            "$lte" => Some(KeyPredicate::new(vec![KeyInterval::upper(arg.clone(), true)])),
            "$in" => arg.as_array().map(|items| {
                KeyPredicate::new(items.iter().cloned().map(KeyInterval::point).collect())
            }),
            _ => None,
        };
        acc = conjoin(acc, clause);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn equality_and_ranges_on_the_shard_key() {
        let p = extract_key_predicate(&filter(json!({"x": 5, "y": 1})), "x").unwrap();
        assert_eq!(p.intervals(), &[KeyInterval::point(json!(5))]);

        let p = extract_key_predicate(&filter(json!({"x": {"$gte": 0, "$lt": 10}})), "x").unwrap();
        assert_eq!(p.intervals().len(), 1);
        assert_eq!(p.intervals()[0].min, KeyBound::value(0));
        assert_eq!(p.intervals()[0].max, KeyBound::value(10));
        assert!(!p.intervals()[0].max_inclusive);
    }

    #[test]
    fn other_fields_and_negations_do_not_constrain() {
        assert!(extract_key_predicate(&filter(json!({"y": 1})), "x").is_none());
        assert!(extract_key_predicate(&filter(json!({"x": {"$ne": 1}})), "x").is_none());
    }

    #[test]
    fn or_is_a_union_and_gives_up_on_an_open_branch() {
        let p = extract_key_predicate(&filter(json!({"$or": [{"x": 1}, {"x": {"$in": [7, 9]}}]})), "x")
            .unwrap();
        assert_eq!(p.intervals().len(), 3);

        assert!(extract_key_predicate(&filter(json!({"$or": [{"x": 1}, {"y": 2}]})), "x").is_none());
    }

    #[test]
    fn contradictions_are_unsatisfiable() {
        let p = extract_key_predicate(&filter(json!({"$and": [{"x": {"$gt": 5}}, {"x": {"$lt": 2}}]})), "x")
            .unwrap();
        assert!(p.is_unsatisfiable());
    }
}
