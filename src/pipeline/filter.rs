//! `$match` filter language.

use std::cmp::Ordering;

use serde_json::Value;

use crate::core::value::{compare_values, get_path, type_rank, values_equal};
use crate::core::{Document, Result, RouterError};

const FIELD_OPERATORS: [&str; 9] = ["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists"];

/// Rejects unknown operators up front so a bad filter fails before dispatch.
pub fn validate_filter(filter: &Document) -> Result<()> {
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let branches = value.as_array().filter(|b| !b.is_empty()).ok_or_else(|| {
                    RouterError::ParseError(format!("{} must be a nonempty array", key))
                })?;
                for branch in branches {
                    let branch = branch.as_object().ok_or_else(|| {
                        RouterError::ParseError(format!("{} entries must be objects", key))
                    })?;
                    validate_filter(branch)?;
                }
            }
            op if op.starts_with('$') => {
                return Err(RouterError::ParseError(format!(
                    "unknown top level operator: {}",
                    op
                )));
            }
            _ => {
                if let Some(ops) = operator_document(value) {
                    for (op, arg) in ops {
                        if !FIELD_OPERATORS.contains(&op.as_str()) {
                            return Err(RouterError::ParseError(format!("unknown operator: {}", op)));
                        }
                        if matches!(op.as_str(), "$in" | "$nin") && !arg.is_array() {
                            return Err(RouterError::ParseError(format!("{} needs an array", op)));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Whether `doc` satisfies `filter`.
pub fn matches(filter: &Document, doc: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_branches(condition, doc)?,
            "$or" => any_branch(condition, doc)?,
            "$nor" => !any_branch(condition, doc)?,
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn branches(condition: &Value) -> Result<impl Iterator<Item = &Document>> {
    let items = condition
        .as_array()
        .ok_or_else(|| RouterError::ParseError("logical operators need an array".into()))?;
    Ok(items.iter().filter_map(Value::as_object))
}

fn all_branches(condition: &Value, doc: &Document) -> Result<bool> {
    for branch in branches(condition)? {
        if !matches(branch, doc)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_branch(condition: &Value, doc: &Document) -> Result<bool> {
    for branch in branches(condition)? {
        if matches(branch, doc)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn operator_document(value: &Value) -> Option<&Document> {
    value
        .as_object()
        .filter(|obj| !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')))
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> Result<bool> {
    let Some(ops) = operator_document(condition) else {
        return Ok(equals(actual, condition));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(actual, arg),
            "$ne" => !equals(actual, arg),
            "$gt" => compares(actual, arg, |o| o == Ordering::Greater),
            "$gte" => compares(actual, arg, |o| o != Ordering::Less),
            "$lt" => compares(actual, arg, |o| o == Ordering::Less),
            "$lte" => compares(actual, arg, |o| o != Ordering::Greater),
            "$in" => in_list(actual, arg)?,
            "$nin" => !in_list(actual, arg)?,
            "$exists" => actual.is_some() == crate::core::value::is_truthy(arg),
            other => {
                return Err(RouterError::ParseError(format!("unknown operator: {}", other)));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array-element matching; a missing field equals `null`.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

/// Range comparisons only hold between values of the same type class.
fn compares(actual: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |value: &Value| type_rank(value) == type_rank(bound) && accept(compare_values(value, bound));
    match actual {
        None => false,
        Some(Value::Array(items)) if !bound.is_array() => items.iter().any(check),
        Some(value) => check(value),
    }
}

fn in_list(actual: Option<&Value>, list: &Value) -> Result<bool> {
    let items = list
        .as_array()
        .ok_or_else(|| RouterError::ParseError("$in needs an array".into()))?;
    Ok(items.iter().any(|candidate| equals(actual, candidate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn equality_ranges_and_arrays() {
        let d = doc(json!({"a": 5, "tags": ["x", "y"], "n": {"v": 2}}));
        assert!(matches(&doc(json!({"a": 5})), &d).unwrap());
        assert!(matches(&doc(json!({"tags": "y"})), &d).unwrap());
        assert!(matches(&doc(json!({"n.v": {"$gte": 2, "$lt": 3}})), &d).unwrap());
        assert!(!matches(&doc(json!({"a": {"$gt": "a"}})), &d).unwrap());
        assert!(matches(&doc(json!({"missing": null})), &d).unwrap());
        assert!(matches(&doc(json!({"missing": {"$exists": false}})), &d).unwrap());
    }

    #[test]
    fn logical_operators() {
        let d = doc(json!({"a": 1, "b": 2}));
        assert!(matches(&doc(json!({"$or": [{"a": 2}, {"b": 2}]})), &d).unwrap());
        assert!(!matches(&doc(json!({"$nor": [{"a": 1}]})), &d).unwrap());
        assert!(matches(&doc(json!({"a": {"$in": [0, 1]}, "b": {"$nin": [1]}})), &d).unwrap());
    }

    #[test]
    fn unknown_operators_are_rejected() {
        assert!(validate_filter(&doc(json!({"a": {"$regex": "x"}}))).is_err());
        assert!(validate_filter(&doc(json!({"$where": "1"}))).is_err());
        assert!(validate_filter(&doc(json!({"$or": []}))).is_err());
    }
}
