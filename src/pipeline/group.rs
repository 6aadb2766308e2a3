use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::stage::{Accumulator, GroupSpec};
use crate::core::value::{OrderedValue, add_numbers, as_f64, compare_values, number_from_f64, values_equal};
use crate::core::{Document, Result, RouterError};
use crate::evaluator;

/// Which half of a `$group` is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Unsplit: raw input, final output.
    Full,
    /// Shard side: raw input, partial state output.
    Partial,
    /// Merge side: partial state input, final output.
    Merge,
}

#[derive(Debug, Clone)]
enum AccState {
    Sum(Value),
    Avg { sum: Value, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    Count(i64),
}

impl AccState {
    fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Sum(_) => Self::Sum(Value::from(0)),
            Accumulator::Avg(_) => Self::Avg {
                sum: Value::from(0),
                count: 0,
            },
            Accumulator::Min(_) => Self::Min(None),
            Accumulator::Max(_) => Self::Max(None),
            Accumulator::First(_) => Self::First(None),
            Accumulator::Last(_) => Self::Last(None),
            Accumulator::Push(_) => Self::Push(Vec::new()),
            Accumulator::AddToSet(_) => Self::AddToSet(Vec::new()),
            Accumulator::Count => Self::Count(0),
        }
    }

    /// Folds one raw input value in. Non-numeric input is ignored by `$sum`
    /// and `$avg`, null by `$min` and `$max`.
    fn accumulate(&mut self, value: Value) -> Result<()> {
        match self {
            Self::Sum(total) => {
                if value.is_number() {
                    *total = add_numbers(total, &value)?;
                }
            }
            Self::Avg { sum, count } => {
                if value.is_number() {
                    *sum = add_numbers(sum, &value)?;
                    *count += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, |ord| ord.is_lt()),
            Self::Max(current) => keep_extreme(current, value, |ord| ord.is_gt()),
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Self::Last(current) => *current = Some(value),
            Self::Push(items) => items.push(value),
            Self::AddToSet(items) => add_unique(items, value),
            Self::Count(n) => *n += 1,
        }
        Ok(())
    }

    /// Folds one partial state produced by `partial` on another shard.
    fn absorb(&mut self, partial: Value) -> Result<()> {
        match self {
            Self::Sum(total) => {
                if partial.is_number() {
                    *total = add_numbers(total, &partial)?;
                }
            }
            Self::Avg { sum, count } => {
                let part_sum = partial.get("sum").cloned().unwrap_or(Value::from(0));
                let part_count = partial.get("count").and_then(Value::as_i64).ok_or_else(|| {
                    RouterError::ExecutionError(format!("malformed partial $avg state: {}", partial))
                })?;
                *sum = add_numbers(sum, &part_sum)?;
                *count += part_count;
            }
            Self::Min(current) => keep_extreme(current, partial, |ord| ord.is_lt()),
            Self::Max(current) => keep_extreme(current, partial, |ord| ord.is_gt()),
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(partial);
                }
            }
            Self::Last(current) => *current = Some(partial),
            Self::Push(items) => items.extend(expect_array(partial)?),
            Self::AddToSet(items) => {
                for value in expect_array(partial)? {
                    add_unique(items, value);
                }
            }
            Self::Count(n) => *n += partial.as_i64().unwrap_or(0),
        }
        Ok(())
    }

    fn partial(self) -> Value {
        match self {
            Self::Avg { sum, count } => json!({ "sum": sum, "count": count }),
            other => other.finalize(),
        }
    }

    fn finalize(self) -> Value {
        match self {
            Self::Sum(total) => total,
            Self::Avg { count: 0, .. } => Value::Null,
            Self::Avg { sum, count } => number_from_f64(as_f64(&sum).unwrap_or(0.0) / count as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => v.unwrap_or(Value::Null),
            Self::Push(items) | Self::AddToSet(items) => Value::Array(items),
            Self::Count(n) => Value::from(n),
        }
    }
}

fn keep_extreme(current: &mut Option<Value>, value: Value, better: impl Fn(std::cmp::Ordering) -> bool) {
    if value.is_null() {
        return;
    }
    let replace = match current {
        None => true,
        Some(existing) => better(compare_values(&value, existing)),
    };
    if replace {
        *current = Some(value);
    }
}

fn add_unique(items: &mut Vec<Value>, value: Value) {
    if !items.iter().any(|existing| values_equal(existing, &value)) {
        items.push(value);
    }
}

fn expect_array(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RouterError::ExecutionError(format!(
            "partial $push/$addToSet state must be an array, got {}",
            other
        ))),
    }
}

/// Runs one half (or the whole) of a `$group` over `input`.
///
/// Output is ordered by group key.
pub fn run_group(spec: &GroupSpec, mode: GroupMode, input: Vec<Document>) -> Result<Vec<Document>> {
    let mut groups: BTreeMap<OrderedValue, (Value, Vec<AccState>)> = BTreeMap::new();

    for doc in input {
        let key = match mode {
            GroupMode::Merge => doc.get("_id").cloned().unwrap_or(Value::Null),
            GroupMode::Full | GroupMode::Partial => evaluator::evaluate(&spec.id, &doc)?,
        };
        let (_, states) = groups.entry(OrderedValue(key.clone())).or_insert_with(|| {
            (
                key,
                spec.accumulators
                    .iter()
                    .map(|acc| AccState::new(&acc.accumulator))
                    .collect(),
            )
        });

        for (acc, state) in spec.accumulators.iter().zip(states.iter_mut()) {
            match mode {
                GroupMode::Merge => {
                    state.absorb(doc.get(&acc.output).cloned().unwrap_or(Value::Null))?
                }
                GroupMode::Full | GroupMode::Partial => {
                    let value = match acc.accumulator.argument() {
                        Some(expr) => evaluator::evaluate(expr, &doc)?,
                        None => Value::Null,
                    };
                    state.accumulate(value)?
                }
            }
        }
    }

    Ok(groups
        .into_values()
        .map(|(key, states)| {
            let mut out = Document::new();
            out.insert("_id".into(), key);
            for (acc, state) in spec.accumulators.iter().zip(states) {
                let value = match mode {
                    GroupMode::Partial => state.partial(),
                    GroupMode::Full | GroupMode::Merge => state.finalize(),
                };
                out.insert(acc.output.clone(), value);
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values.into_iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    fn group(spec: Value) -> GroupSpec {
        match Stage::parse(&json!({ "$group": spec })).unwrap() {
            Stage::Group(spec) => spec,
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn partial_then_merge_matches_a_single_pass() {
        let spec = group(json!({
            "_id": "$k",
            "total": {"$sum": "$v"},
            "mean": {"$avg": "$v"},
            "low": {"$min": "$v"},
            "n": {"$count": {}},
            "all": {"$addToSet": "$v"}
        }));
        let shard_a = docs(vec![json!({"k": "a", "v": 1}), json!({"k": "b", "v": 4})]);
        let shard_b = docs(vec![json!({"k": "a", "v": 3}), json!({"k": "a", "v": 1})]);

        let mut partials = run_group(&spec, GroupMode::Partial, shard_a.clone()).unwrap();
        partials.extend(run_group(&spec, GroupMode::Partial, shard_b.clone()).unwrap());
        let merged = run_group(&spec, GroupMode::Merge, partials).unwrap();

        let mut all = shard_a;
        all.extend(shard_b);
        let single = run_group(&spec, GroupMode::Full, all).unwrap();

        assert_eq!(merged, single);
        assert_eq!(merged[0].get("total"), Some(&json!(5)));
        assert_eq!(merged[0].get("n"), Some(&json!(3)));
        assert_eq!(merged[0].get("all").and_then(Value::as_array).map(Vec::len), Some(2));
    }

    #[test]
    fn avg_partial_state_carries_sum_and_count() {
        let spec = group(json!({"_id": null, "mean": {"$avg": "$v"}}));
        let out = run_group(&spec, GroupMode::Partial, docs(vec![json!({"v": 2}), json!({"v": "x"})])).unwrap();
        assert_eq!(out[0].get("mean"), Some(&json!({"sum": 2, "count": 1})));
    }
}
