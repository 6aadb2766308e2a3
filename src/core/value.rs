use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::core::{Document, Result, RouterError};

// ============================================================================
// Canonical ordering
// ============================================================================
//
// Document-database type order, used for shard keys, $sort and $min/$max:
// null < numbers < strings < objects < arrays < booleans.
// MinKey / MaxKey live in `routing::KeyBound`, outside of JSON.

pub(crate) fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Human readable type name for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Object(obj) if obj.contains_key("$date") => "date",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::Bool(_) => "bool",
    }
}

pub fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            // NaN sorts below every other number.
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// `Value` ordered by [`compare_values`], usable as a map key.
#[derive(Debug, Clone)]
pub struct OrderedValue(pub Value);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

/// Equality under the canonical order, so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

// ============================================================================
// Field paths
// ============================================================================

/// Resolves a dotted path without descending into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate documents as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

// ============================================================================
// Numbers and dates
// ============================================================================

/// JSON has no NaN or infinity; those become null.
pub fn number_from_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Adds two numeric values, keeping integers exact until they overflow.
pub fn add_numbers(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                if let Some(sum) = i.checked_add(j) {
                    return Ok(Value::from(sum));
                }
            }
            let sum = x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0);
            Ok(number_from_f64(sum))
        }
        _ => Err(RouterError::TypeMismatch(format!(
            "cannot add {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

pub fn date_value(instant: DateTime<Utc>) -> Value {
    let mut doc = Document::new();
    doc.insert(
        "$date".to_string(),
        Value::String(instant.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(doc)
}

pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_object()?.get("$date")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!(2), &json!(1.5)), Ordering::Greater);
        assert!(values_equal(&json!(3), &json!(3.0)));
    }

    #[test]
    fn type_order_puts_null_first_and_bools_last() {
        let mut values = vec![json!(true), json!("a"), json!(null), json!([1]), json!({"a": 1}), json!(7)];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![json!(null), json!(7), json!("a"), json!({"a": 1}), json!([1]), json!(true)]
        );
    }

    #[test]
    fn dotted_paths_read_and_write() {
        let mut doc = json!({"a": {"b": 1}}).as_object().cloned().unwrap();
        assert_eq!(get_path(&doc, "a.b"), Some(&json!(1)));
        set_path(&mut doc, "a.c.d", json!(2));
        assert_eq!(get_path(&doc, "a.c.d"), Some(&json!(2)));
        assert_eq!(remove_path(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(get_path(&doc, "a.b"), None);
    }

    #[test]
    fn integer_addition_falls_back_to_float_on_overflow() {
        assert_eq!(add_numbers(&json!(2), &json!(3)).unwrap(), json!(5));
        let big = add_numbers(&json!(i64::MAX), &json!(1)).unwrap();
        assert!(big.is_f64());
    }
}
