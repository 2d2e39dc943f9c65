//! Producer-side item predicates.
//!
//! A [`Predicate`] decides whether an item is published. Any
//! `Fn(&Item) -> bool` is a predicate; [`FieldCondition`] parses the
//! `condition` option:
//!
//! - `path` publishes when the field is truthy
//! - `!path` publishes when the field is missing or falsy
//! - `path == <json>` / `path != <json>` compare against a JSON literal
//!   (bare words compare as strings)
//!
//! Paths use dot notation, optionally prefixed with `$.`; numeric segments
//! index into arrays. On raw documents a single-segment path reads a header.

use serde_json::Value;
use std::fmt;

use crate::error::{Result, StageError};
use crate::types::Item;

/// Decides whether an item gets published
pub trait Predicate: Send + Sync {
    fn test(&self, item: &Item) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Item) -> bool + Send + Sync,
{
    fn test(&self, item: &Item) -> bool {
        self(item)
    }
}

/// Accepts every item
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl Predicate for Always {
    fn test(&self, _item: &Item) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Truthy,
    Falsy,
    Equals,
    NotEquals,
}

/// A parsed `condition` expression
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    path: Vec<String>,
    operator: Operator,
    value: Value,
}

impl FieldCondition {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();

        let (path, operator, value) = if let Some((left, right)) = expression.split_once("==") {
            (left, Operator::Equals, Some(right))
        } else if let Some((left, right)) = expression.split_once("!=") {
            (left, Operator::NotEquals, Some(right))
        } else if let Some(path) = expression.strip_prefix('!') {
            (path, Operator::Falsy, None)
        } else {
            (expression, Operator::Truthy, None)
        };

        let path = path.trim();
        let path = path.strip_prefix("$.").unwrap_or(path);
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(StageError::InvalidConfig(format!(
                "condition '{}' has no valid field path",
                expression
            )));
        }

        let value = match value.map(str::trim) {
            None => Value::Null,
            Some("") => {
                return Err(StageError::InvalidConfig(format!(
                    "condition '{}' is missing a comparison value",
                    expression
                )))
            }
            Some(literal) => serde_json::from_str(literal)
                .unwrap_or_else(|_| Value::String(literal.to_string())),
        };

        Ok(Self {
            path: path.split('.').map(str::to_string).collect(),
            operator,
            value,
        })
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Field value for this condition's path; `Null` when absent
    fn extract(&self, item: &Item) -> Value {
        match item {
            Item::Map(map) => {
                let Some((first, rest)) = self.path.split_first() else {
                    return Value::Null;
                };
                let mut current = match map.get(first) {
                    Some(value) => value,
                    None => return Value::Null,
                };
                for part in rest {
                    current = match current {
                        Value::Object(map) => match map.get(part) {
                            Some(value) => value,
                            None => return Value::Null,
                        },
                        Value::Array(values) => match part.parse::<usize>().ok().and_then(|i| values.get(i)) {
                            Some(value) => value,
                            None => return Value::Null,
                        },
                        _ => return Value::Null,
                    };
                }
                current.clone()
            }
            Item::Document(document) if self.path.len() == 1 => document
                .header(&self.path[0])
                .map(|value| Value::String(value.to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(values) => !values.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

impl Predicate for FieldCondition {
    fn test(&self, item: &Item) -> bool {
        let field = self.extract(item);
        match self.operator {
            Operator::Truthy => truthy(&field),
            Operator::Falsy => !truthy(&field),
            Operator::Equals => field == self.value,
            Operator::NotEquals => field != self.value,
        }
    }
}

impl fmt::Display for FieldCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path.join(".");
        match self.operator {
            Operator::Truthy => write!(f, "{}", path),
            Operator::Falsy => write!(f, "!{}", path),
            Operator::Equals => write!(f, "{} == {}", path, self.value),
            Operator::NotEquals => write!(f, "{} != {}", path, self.value),
        }
    }
}
