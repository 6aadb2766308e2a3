use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr};
use super::{operator_name, positional};
use crate::core::value::{add_numbers, as_f64, number_from_f64, type_name};
use crate::core::{Document, Result, RouterError};

pub struct ArithmeticEvaluator;

impl ExpressionEvaluator for ArithmeticEvaluator {
    fn name(&self) -> &'static str {
        "ARITHMETIC"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        matches!(
            operator_name(expr),
            Some("$add" | "$subtract" | "$multiply" | "$divide" | "$mod")
        )
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let (name, args) = positional(expr, None)?;
        let values = args
            .iter()
            .map(|arg| context.evaluate(arg, doc))
            .collect::<Result<Vec<_>>>()?;

        // Null or missing operands make the whole expression null.
        if values.iter().any(Value::is_null) {
            return Ok(Value::Null);
        }
        for value in &values {
            if !value.is_number() {
                return Err(RouterError::TypeMismatch(format!(
                    "{} only supports numeric types, not {}",
                    name,
                    type_name(value)
                )));
            }
        }

        match name {
            "$add" => values
                .iter()
                .try_fold(Value::from(0), |acc, v| add_numbers(&acc, v)),
            "$multiply" => Ok(values.iter().fold(Value::from(1), |acc, v| multiply(&acc, v))),
            "$subtract" | "$divide" | "$mod" => {
                let [left, right] = values.as_slice() else {
                    return Err(RouterError::ParseError(format!(
                        "Expression {} takes exactly 2 arguments. {} were passed in.",
                        name,
                        values.len()
                    )));
                };
                binary(name, left, right)
            }
            _ => unreachable!(),
        }
    }
}

fn multiply(a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(product) = x.checked_mul(y) {
            return Value::from(product);
        }
    }
    number_from_f64(as_f64(a).unwrap_or(0.0) * as_f64(b).unwrap_or(0.0))
}

fn binary(name: &str, left: &Value, right: &Value) -> Result<Value> {
    let ints = (left.as_i64(), right.as_i64());
    match name {
        "$subtract" => Ok(match ints {
            (Some(a), Some(b)) => a
                .checked_sub(b)
                .map(Value::from)
                .unwrap_or_else(|| number_from_f64(a as f64 - b as f64)),
            _ => number_from_f64(as_f64(left).unwrap_or(0.0) - as_f64(right).unwrap_or(0.0)),
        }),
        "$divide" => {
            let divisor = as_f64(right).unwrap_or(0.0);
            if divisor == 0.0 {
                return Err(RouterError::ExecutionError("can't $divide by zero".into()));
            }
            Ok(number_from_f64(as_f64(left).unwrap_or(0.0) / divisor))
        }
        "$mod" => match ints {
            (Some(_), Some(0)) => Err(RouterError::ExecutionError("can't $mod by zero".into())),
            (Some(a), Some(b)) => Ok(Value::from(a.wrapping_rem(b))),
            _ => {
                let divisor = as_f64(right).unwrap_or(0.0);
                if divisor == 0.0 {
                    return Err(RouterError::ExecutionError("can't $mod by zero".into()));
                }
                Ok(number_from_f64(as_f64(left).unwrap_or(0.0) % divisor))
            }
        },
        _ => unreachable!(),
    }
}
