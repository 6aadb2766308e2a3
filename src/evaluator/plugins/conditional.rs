use serde_json::Value;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr, OperatorArgs};
use super::operator_name;
use crate::core::value::is_truthy;
use crate::core::{Document, Result, RouterError};

/// `$cond` and `$ifNull`.
pub struct ConditionalEvaluator;

impl ExpressionEvaluator for ConditionalEvaluator {
    fn name(&self) -> &'static str {
        "CONDITIONAL"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        matches!(operator_name(expr), Some("$cond" | "$ifNull"))
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let Expr::Operator { name, args } = expr else {
            unreachable!();
        };

        if name == "$cond" {
            let (condition, then, otherwise) = match args {
                OperatorArgs::Positional(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                OperatorArgs::Named(_) => match (args.named("if"), args.named("then"), args.named("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => {
                        return Err(RouterError::ParseError(
                            "$cond requires 'if', 'then' and 'else'".into(),
                        ));
                    }
                },
                _ => {
                    return Err(RouterError::ParseError(
                        "$cond takes exactly 3 arguments".into(),
                    ));
                }
            };
            return if is_truthy(&context.evaluate(condition, doc)?) {
                context.evaluate(then, doc)
            } else {
                context.evaluate(otherwise, doc)
            };
        }

        let OperatorArgs::Positional(items) = args else {
            return Err(RouterError::ParseError("$ifNull takes an array of arguments".into()));
        };
        let Some((fallback, candidates)) = items.split_last() else {
            return Err(RouterError::ParseError("$ifNull needs at least 2 arguments".into()));
        };
        if candidates.is_empty() {
            return Err(RouterError::ParseError("$ifNull needs at least 2 arguments".into()));
        }
        for candidate in candidates {
            let value = context.evaluate(candidate, doc)?;
            if !value.is_null() {
                return Ok(value);
            }
        }
        context.evaluate(fallback, doc)
    }
}
