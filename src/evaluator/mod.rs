pub mod plugins;

use lazy_static::lazy_static;
use serde_json::Value;
use tracing::trace;

use crate::core::{Document, Result, RouterError};

/// Aggregation expression, parsed once per pipeline and evaluated per document.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `"$a.b"`, stored without the leading `$`.
    FieldPath(String),
    /// `"$$ROOT"` / `"$$CURRENT"`.
    Root,
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Operator { name: String, args: OperatorArgs },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorArgs {
    /// `{$add: [a, b]}` or the single-argument shorthand `{$toUpper: a}`.
    Positional(Vec<Expr>),
    /// `{$cond: {if, then, else}}`, `{$dateFromString: {dateString, ...}}`.
    Named(Vec<(String, Expr)>),
}

impl OperatorArgs {
    pub fn named(&self, key: &str) -> Option<&Expr> {
        match self {
            Self::Named(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, e)| e),
            Self::Positional(_) => None,
        }
    }
}

impl Expr {
    pub fn field(path: impl Into<String>) -> Self {
        Self::FieldPath(path.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Parses the JSON form of an expression, rejecting unknown operators.
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s.starts_with("$$") => match s.as_str() {
                "$$ROOT" | "$$CURRENT" => Ok(Self::Root),
                other => Err(RouterError::ParseError(format!(
                    "Use of undefined variable: {}",
                    other.trim_start_matches("$$")
                ))),
            },
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() {
                    return Err(RouterError::ParseError("'$' is not a valid field path".into()));
                }
                Ok(Self::FieldPath(path.to_string()))
            }
            Value::Array(items) => Ok(Self::Array(
                items.iter().map(Self::parse).collect::<Result<_>>()?,
            )),
            Value::Object(obj) => Self::parse_object(obj),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn parse_object(obj: &Document) -> Result<Self> {
        let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys == 0 {
            let fields = obj
                .iter()
                .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                .collect::<Result<_>>()?;
            return Ok(Self::Object(fields));
        }
        if obj.len() != 1 {
            return Err(RouterError::ParseError(format!(
                "an expression specification must contain exactly one field, found {}",
                obj.len()
            )));
        }

        let Some((name, arg)) = obj.iter().next() else {
            return Err(RouterError::ParseError("empty expression".into()));
        };
        if name == "$literal" {
            return Ok(Self::Literal(arg.clone()));
        }

        let args = match arg {
            Value::Array(items) => {
                OperatorArgs::Positional(items.iter().map(Self::parse).collect::<Result<_>>()?)
            }
            Value::Object(inner) if !inner.is_empty() && inner.keys().all(|k| !k.starts_with('$')) => {
                OperatorArgs::Named(
                    inner
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                        .collect::<Result<_>>()?,
                )
            }
            single => OperatorArgs::Positional(vec![Self::parse(single)?]),
        };

        let expr = Self::Operator {
            name: name.clone(),
            args,
        };
        if default_registry().find_evaluator(&expr).is_none() {
            return Err(RouterError::ParseError(format!(
                "Unrecognized expression '{}'",
                name
            )));
        }
        Ok(expr)
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Literal(v) => match v {
                // Strings that look like paths must stay literal.
                Value::String(s) if s.starts_with('$') => serde_json::json!({ "$literal": s }),
                Value::Object(_) | Value::Array(_) => serde_json::json!({ "$literal": v }),
                other => other.clone(),
            },
            Self::FieldPath(path) => Value::String(format!("${}", path)),
            Self::Root => Value::String("$$ROOT".into()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.to_json()))
                    .collect(),
            ),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Operator { name, args } => {
                let args = match args {
                    OperatorArgs::Positional(items) => {
                        Value::Array(items.iter().map(Self::to_json).collect())
                    }
                    OperatorArgs::Named(fields) => Value::Object(
                        fields
                            .iter()
                            .map(|(k, e)| (k.clone(), e.to_json()))
                            .collect(),
                    ),
                };
                let mut obj = Document::new();
                obj.insert(name.clone(), args);
                Value::Object(obj)
            }
        }
    }
}

/// Trait for operator plugins
pub trait ExpressionEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Can this evaluator handle the operator expression?
    fn can_evaluate(&self, expr: &Expr) -> bool;

    fn evaluate(&self, expr: &Expr, doc: &Document, context: &EvaluationContext<'_>) -> Result<Value>;
}

/// Evaluation context handed to plugins so they can evaluate their arguments.
pub struct EvaluationContext<'a> {
    registry: &'a EvaluatorRegistry,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(registry: &'a EvaluatorRegistry) -> Self {
        Self { registry }
    }

    pub fn evaluate(&self, expr: &Expr, doc: &Document) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::FieldPath(path) => Ok(resolve_field_path(doc, path).unwrap_or(Value::Null)),
            Expr::Root => Ok(Value::Object(doc.clone())),
            Expr::Object(fields) => {
                let mut out = Document::new();
                for (key, field) in fields {
                    if let Some(value) = self.evaluate_optional(field, doc)? {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(Value::Object(out))
            }
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.evaluate(item, doc))
                    .collect::<Result<_>>()?,
            )),
            Expr::Operator { name, .. } => match self.registry.find_evaluator(expr) {
                Some(evaluator) => evaluator.evaluate(expr, doc, self),
                None => Err(RouterError::ExecutionError(format!(
                    "No evaluator found for expression: {}",
                    name
                ))),
            },
        }
    }

    /// Like `evaluate`, but a field path to a missing field yields `None`.
    pub fn evaluate_optional(&self, expr: &Expr, doc: &Document) -> Result<Option<Value>> {
        match expr {
            Expr::FieldPath(path) => Ok(resolve_field_path(doc, path)),
            other => self.evaluate(other, doc).map(Some),
        }
    }
}

/// Resolves `a.b.c`, fanning out over arrays of subdocuments.
pub fn resolve_field_path(doc: &Document, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?.clone();
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?.clone(),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .filter_map(|item| item.as_object().and_then(|o| o.get(part)).cloned())
                    .collect(),
            ),
            _ => return None,
        };
    }
    Some(current)
}

/// Registry of operator evaluators
pub struct EvaluatorRegistry {
    evaluators: Vec<Box<dyn ExpressionEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            evaluators: Vec::new(),
        }
    }

    pub fn register(&mut self, evaluator: Box<dyn ExpressionEvaluator>) {
        trace!(evaluator = evaluator.name(), "registered expression evaluator");
        self.evaluators.push(evaluator);
    }

    pub fn with_default_evaluators() -> Self {
        use plugins::*;

        let mut registry = Self::new();

        registry.register(Box::new(arithmetic::ArithmeticEvaluator));
        registry.register(Box::new(comparison::ComparisonEvaluator));
        registry.register(Box::new(boolean::BooleanEvaluator));
        registry.register(Box::new(conditional::ConditionalEvaluator));
        registry.register(Box::new(string::StringEvaluator));
        registry.register(Box::new(array::ArrayEvaluator));
        registry.register(Box::new(date::DateFromStringEvaluator));

        registry
    }

    pub fn find_evaluator(&self, expr: &Expr) -> Option<&dyn ExpressionEvaluator> {
        self.evaluators
            .iter()
            .find(|ev| ev.can_evaluate(expr))
            .map(|boxed| &**boxed)
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_default_evaluators()
    }
}

lazy_static! {
    static ref DEFAULT_REGISTRY: EvaluatorRegistry = EvaluatorRegistry::with_default_evaluators();
}

pub fn default_registry() -> &'static EvaluatorRegistry {
    &DEFAULT_REGISTRY
}

/// Evaluates `expr` against `doc` with the built-in operators.
pub fn evaluate(expr: &Expr, doc: &Document) -> Result<Value> {
    EvaluationContext::new(default_registry()).evaluate(expr, doc)
}

pub fn evaluate_optional(expr: &Expr, doc: &Document) -> Result<Option<Value>> {
    EvaluationContext::new(default_registry()).evaluate_optional(expr, doc)
}
