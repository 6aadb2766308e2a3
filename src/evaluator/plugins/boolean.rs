use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr};
use super::{operator_name, positional};
use crate::core::value::is_truthy;
use crate::core::{Document, Result};

pub struct BooleanEvaluator;

impl ExpressionEvaluator for BooleanEvaluator {
    fn name(&self) -> &'static str {
        "BOOLEAN"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        matches!(operator_name(expr), Some("$and" | "$or" | "$not"))
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let (name, args) = positional(expr, None)?;
        let result = match name {
            "$not" => {
                let (_, args) = positional(expr, Some(1))?;
                !is_truthy(&context.evaluate(&args[0], doc)?)
            }
            "$and" => {
                let mut all = true;
                for arg in args {
                    if !is_truthy(&context.evaluate(arg, doc)?) {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for arg in args {
                    if is_truthy(&context.evaluate(arg, doc)?) {
                        any = true;
                        break;
                    }
                }
                any
            }
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }
}
