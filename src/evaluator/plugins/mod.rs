pub mod arithmetic;
pub mod array;
pub mod boolean;
pub mod comparison;
pub mod conditional;
pub mod date;
pub mod string;

use super::{Expr, OperatorArgs};
use crate::core::{Result, RouterError};

pub(crate) fn operator_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Operator { name, .. } => Some(name.as_str()),
        _ => None,
    }
}

/// Positional arguments of `expr`, checked against an exact arity when given.
pub(crate) fn positional<'a>(expr: &'a Expr, arity: Option<usize>) -> Result<(&'a str, &'a [Expr])> {
    let Expr::Operator { name, args } = expr else {
        return Err(RouterError::ExecutionError(format!("{:?} is not an operator", expr)));
    };
    let OperatorArgs::Positional(items) = args else {
        return Err(RouterError::ParseError(format!(
            "{} does not accept named arguments",
            name
        )));
    };
    if let Some(expected) = arity {
        if items.len() != expected {
            return Err(RouterError::ParseError(format!(
                "Expression {} takes exactly {} arguments. {} were passed in.",
                name,
                expected,
                items.len()
            )));
        }
    }
    Ok((name.as_str(), items.as_slice()))
}
