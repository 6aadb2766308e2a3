use serde_json::Value;
use tracing::debug;

use super::super::{EvaluationContext, ExpressionEvaluator, Expr, OperatorArgs};
use super::operator_name;
use crate::core::value::{date_value, type_name};
use crate::core::{Document, Result, RouterError};
use crate::date::{parse_date_string, parse_date_with_format};

/// `$dateFromString: {dateString, timezone?, format?, onNull?, onError?}`.
pub struct DateFromStringEvaluator;

const ARGUMENTS: [&str; 5] = ["dateString", "timezone", "format", "onNull", "onError"];

impl ExpressionEvaluator for DateFromStringEvaluator {
    fn name(&self) -> &'static str {
        "DATE_FROM_STRING"
    }

    fn can_evaluate(&self, expr: &Expr) -> bool {
        operator_name(expr) == Some("$dateFromString")
    }

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value> {
        let Expr::Operator { args, .. } = expr else {
            unreachable!();
        };
        let OperatorArgs::Named(fields) = args else {
            return Err(RouterError::ParseError(
                "$dateFromString only supports an object as its argument".into(),
            ));
        };
        if let Some((unknown, _)) = fields.iter().find(|(k, _)| !ARGUMENTS.contains(&k.as_str())) {
            return Err(RouterError::ParseError(format!(
                "Unrecognized argument to $dateFromString: {}",
                unknown
            )));
        }
        let Some(date_string) = args.named("dateString") else {
            return Err(RouterError::ParseError(
                "Missing 'dateString' parameter to $dateFromString".into(),
            ));
        };

        let input = match context.evaluate(date_string, doc)? {
            Value::Null => {
                return match args.named("onNull") {
                    Some(on_null) => context.evaluate(on_null, doc),
                    None => Ok(Value::Null),
                };
            }
            Value::String(s) => s,
            other => {
                return self.on_error(
                    args,
                    doc,
                    context,
                    RouterError::TypeMismatch(format!(
                        "$dateFromString requires that 'dateString' be a string, found: {}",
                        type_name(&other)
                    )),
                );
            }
        };

        let timezone = match args.named("timezone") {
            Some(tz) => match context.evaluate(tz, doc)? {
                Value::Null => return Ok(Value::Null),
                Value::String(s) => Some(s),
                other => {
                    return Err(RouterError::TypeMismatch(format!(
                        "timezone must evaluate to a string, found {}",
                        type_name(&other)
                    )));
                }
            },
            None => None,
        };
        let format = match args.named("format") {
            Some(f) => match context.evaluate(f, doc)? {
                Value::Null => return Ok(Value::Null),
                Value::String(s) => Some(s),
                other => {
                    return Err(RouterError::TypeMismatch(format!(
                        "format must evaluate to a string, found {}",
                        type_name(&other)
                    )));
                }
            },
            None => None,
        };

        let parsed = match &format {
            Some(format) => parse_date_with_format(&input, format, timezone.as_deref()),
            None => parse_date_string(&input, timezone.as_deref()),
        };
        match parsed {
            Ok(instant) => Ok(date_value(instant)),
            Err(err) => self.on_error(args, doc, context, err.into()),
        }
    }
}

impl DateFromStringEvaluator {
    fn on_error(
        &self,
        args: &OperatorArgs,
        doc: &Document,
        context: &EvaluationContext<'_>,
        err: RouterError,
    ) -> Result<Value> {
        match args.named("onError") {
            Some(on_error) => {
                debug!(error = %err, "$dateFromString falling back to onError");
                context.evaluate(on_error, doc)
            }
            None => Err(err),
        }
    }
}
