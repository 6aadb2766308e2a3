use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr};
use super::{operator_name, positional};
use crate::core::value::type_name;
use crate::core::{Document, Result, RouterError};

pub struct ArrayEvaluator;

impl ExpressionEvaluator for ArrayEvaluator {
    fn name(&self) -> &'static str {
        "ARRAY"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        operator_name(expr) == Some("$size")
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let (_, args) = positional(expr, Some(1))?;
        match context.evaluate(&args[0], doc)? {
            Value::Array(items) => Ok(Value::from(items.len())),
            other => Err(RouterError::TypeMismatch(format!(
                "The argument to $size must be an array. Type of argument: {}",
                type_name(&other)
            ))),
        }
    }
}
