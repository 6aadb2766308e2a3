use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr};
use super::{operator_name, positional};
use crate::core::value::type_name;
use crate::core::{Document, Result, RouterError};

pub struct StringEvaluator;

impl ExpressionEvaluator for StringEvaluator {
    fn name(&self) -> &'static str {
        "STRING"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        matches!(operator_name(expr), Some("$concat" | "$toUpper" | "$toLower"))
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let (name, args) = positional(expr, None)?;

        if name == "$concat" {
            let mut out = String::new();
            for arg in args {
                match context.evaluate(arg, doc)? {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => {
                        return Err(RouterError::TypeMismatch(format!(
                            "$concat only supports strings, not {}",
                            type_name(&other)
                        )));
                    }
                }
            }
            return Ok(Value::String(out));
        }

        let (_, args) = positional(expr, Some(1))?;
        let text = match context.evaluate(&args[0], doc)? {
            Value::Null => String::new(),
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(RouterError::TypeMismatch(format!(
                    "{} requires a string, not {}",
                    name,
                    type_name(&other)
                )));
            }
        };
        Ok(Value::String(match name {
            "$toUpper" => text.to_uppercase(),
            _ => text.to_lowercase(),
        }))
    }
}
