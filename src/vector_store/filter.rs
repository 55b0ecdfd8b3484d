//! Metadata values and conjunctive filter expressions.
//!
//! Record metadata is restricted to primitive scalars and lists of strings.
//! Structured values (like a speaker map) are serialized to a string first.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

/// Metadata attached to a stored record.
pub type Metadata = BTreeMap<String, MetadataValue>;

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            MetadataValue::List(items) => Some(items),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            MetadataValue::Bool(b) => json!(b),
            MetadataValue::Number(n) => json!(n),
            MetadataValue::Text(s) => json!(s),
            MetadataValue::List(items) => json!(items),
        }
    }

    /// Equality as a vector store sees it: a list field equals a string
    /// when it contains that string.
    fn matches_eq(&self, expected: &MetadataValue) -> bool {
        match (self, expected) {
            (MetadataValue::List(items), MetadataValue::Text(s)) => items.contains(s),
            (MetadataValue::Number(a), MetadataValue::Number(b)) => (a - b).abs() < f64::EPSILON,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Number(n) => write!(f, "{}", n),
            MetadataValue::Text(s) => write!(f, "\"{}\"", s),
            MetadataValue::List(items) => write!(f, "{:?}", items),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Number(n)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Number(n as f64)
    }
}

impl From<usize> for MetadataValue {
    fn from(n: usize) -> Self {
        MetadataValue::Number(n as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(items: Vec<String>) -> Self {
        MetadataValue::List(items)
    }
}

/// Comparison applied to one metadata field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(MetadataValue),
    Ne(MetadataValue),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<MetadataValue>),
    Nin(Vec<MetadataValue>),
}

impl Condition {
    fn operator(&self) -> &'static str {
        match self {
            Condition::Eq(_) => "$eq",
            Condition::Ne(_) => "$ne",
            Condition::Gt(_) => "$gt",
            Condition::Gte(_) => "$gte",
            Condition::Lt(_) => "$lt",
            Condition::Lte(_) => "$lte",
            Condition::In(_) => "$in",
            Condition::Nin(_) => "$nin",
        }
    }

    fn operand_json(&self) -> Value {
        match self {
            Condition::Eq(v) | Condition::Ne(v) => v.to_json(),
            Condition::Gt(n) | Condition::Gte(n) | Condition::Lt(n) | Condition::Lte(n) => json!(n),
            Condition::In(vs) | Condition::Nin(vs) => {
                Value::Array(vs.iter().map(MetadataValue::to_json).collect())
            }
        }
    }

    /// Evaluate against a field value; `None` means the field is absent.
    fn evaluate(&self, value: Option<&MetadataValue>) -> bool {
        match self {
            Condition::Eq(expected) => value.is_some_and(|v| v.matches_eq(expected)),
            Condition::Ne(expected) => !value.is_some_and(|v| v.matches_eq(expected)),
            Condition::Gt(bound) => value.and_then(MetadataValue::as_f64).is_some_and(|v| v > *bound),
            Condition::Gte(bound) => value.and_then(MetadataValue::as_f64).is_some_and(|v| v >= *bound),
            Condition::Lt(bound) => value.and_then(MetadataValue::as_f64).is_some_and(|v| v < *bound),
            Condition::Lte(bound) => value.and_then(MetadataValue::as_f64).is_some_and(|v| v <= *bound),
            Condition::In(options) => value.is_some_and(|v| options.iter().any(|o| v.matches_eq(o))),
            Condition::Nin(options) => !value.is_some_and(|v| options.iter().any(|o| v.matches_eq(o))),
        }
    }
}

/// A condition bound to a metadata field name.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub condition: Condition,
}

/// Conjunction of predicates. Empty matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    /// The empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Filter::push`].
    pub fn and(mut self, field: &str, condition: Condition) -> Self {
        self.push(field, condition);
        self
    }

    /// Conjoin another predicate.
    pub fn push(&mut self, field: &str, condition: Condition) {
        self.predicates.push(Predicate {
            field: field.to_string(),
            condition,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// First predicate on `field`, if any.
    pub fn condition_on(&self, field: &str) -> Option<&Condition> {
        self.predicates
            .iter()
            .find(|p| p.field == field)
            .map(|p| &p.condition)
    }

    /// True when every predicate holds for `metadata`.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.predicates
            .iter()
            .all(|p| p.condition.evaluate(metadata.get(&p.field)))
    }

    /// Render as a Pinecone-style filter document.
    pub fn to_json(&self) -> Value {
        let clauses: Vec<Value> = self
            .predicates
            .iter()
            .map(|p| json!({ p.field.clone(): { p.condition.operator(): p.condition.operand_json() } }))
            .collect();
        match clauses.len() {
            0 => json!({}),
            1 => clauses.into_iter().next().unwrap_or_else(|| json!({})),
            _ => json!({ "$and": clauses }),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predicates.is_empty() {
            return write!(f, "<all>");
        }
        let parts: Vec<String> = self
            .predicates
            .iter()
            .map(|p| {
                let rhs = match &p.condition {
                    Condition::Eq(v) => format!("= {}", v),
                    Condition::Ne(v) => format!("!= {}", v),
                    Condition::Gt(n) => format!("> {}", n),
                    Condition::Gte(n) => format!(">= {}", n),
                    Condition::Lt(n) => format!("< {}", n),
                    Condition::Lte(n) => format!("<= {}", n),
                    Condition::In(vs) => format!(
                        "in [{}]",
                        vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
                    ),
                    Condition::Nin(vs) => format!(
                        "not in [{}]",
                        vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
                    ),
                };
                format!("{} {}", p.field, rhs)
            })
            .collect();
        write!(f, "{}", parts.join(" AND "))
    }
}
