use std::cmp::Ordering;

use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr};
use super::{operator_name, positional};
use crate::core::value::compare_values;
use crate::core::{Document, Result};

pub struct ComparisonEvaluator;

impl ExpressionEvaluator for ComparisonEvaluator {
    fn name(&self) -> &'static str {
        "COMPARISON"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        matches!(
            operator_name(expr),
            Some("$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp")
        )
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let (name, args) = positional(expr, Some(2))?;
        let left = context.evaluate(&args[0], doc)?;
        let right = context.evaluate(&args[1], doc)?;
        let ord = compare_values(&left, &right);

        let result = match name {
            "$cmp" => {
                return Ok(Value::from(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }));
            }
            "$eq" => ord == Ordering::Equal,
            "$ne" => ord != Ordering::Equal,
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            "$lte" => ord != Ordering::Greater,
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }
}
