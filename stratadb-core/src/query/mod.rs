//! Predicate queries over range scans
//!
//! Supports:
//! - `SELECT */key/value FROM <any> [WHERE ..] [ORDER BY key] [LIMIT n] [OFFSET n]`
//! - Bare predicates (`category = 'books' AND price < 30`)
//! - Comparisons, AND/OR/NOT, BETWEEN, IN, LIKE, IS [NOT] NULL
//! - Placeholders (`$name`, `:name`, `@name`, `?`) bound from params
//!
//! Values are opaque to the engine; the executor decodes them per query
//! (delimited, JSON or raw) to evaluate the predicate. There are no
//! secondary indexes: cost follows the scanned key range.

mod executor;
mod parser;

pub use executor::QueryExecutor;
pub use parser::QueryParser;

use crate::types::{Key, KeyRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Query parameters: placeholder bindings plus decoding and range options
pub type QueryParams = HashMap<String, String>;

// ============================================================================
// Query Result Types
// ============================================================================

/// Query result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows in scan order
    pub rows: Vec<QueryRow>,
    /// Records examined
    pub scanned: usize,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

/// A single result row; columns left out of the projection are `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Outcome of [`crate::Database::execute_query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Ok,
    /// The predicate could not be parsed; nothing was scanned
    Unsupported,
    /// The scan itself failed
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Ok => write!(f, "ok"),
            QueryStatus::Unsupported => write!(f, "unsupported"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Status-carrying query response for callers that never see `Err`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: QueryStatus,
    pub results: Vec<QueryRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub scanned: usize,
}

impl QueryResponse {
    pub fn ok(result: QueryResult) -> Self {
        Self {
            status: QueryStatus::Ok,
            results: result.rows,
            message: None,
            scanned: result.scanned,
        }
    }

    pub fn failed(status: QueryStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            results: Vec::new(),
            message: Some(message.into()),
            scanned: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == QueryStatus::Ok
    }
}

/// Query value types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QueryValue {
    Null,
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl QueryValue {
    /// Type a textual parameter: integer, then float, else string
    pub fn infer(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            QueryValue::Integer(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            QueryValue::Float(f)
        } else {
            QueryValue::String(raw.to_string())
        }
    }

    /// Numeric view; strings count when they parse as numbers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QueryValue::Float(v) => Some(*v),
            QueryValue::Integer(v) => Some(*v as f64),
            QueryValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            QueryValue::String(s) => Some(s.clone()),
            QueryValue::Float(v) => Some(v.to_string()),
            QueryValue::Integer(v) => Some(v.to_string()),
            QueryValue::Boolean(v) => Some(v.to_string()),
            QueryValue::Null => None,
        }
    }

    pub fn as_key(&self) -> Option<Key> {
        match self {
            QueryValue::Integer(v) => Some(*v),
            QueryValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, QueryValue::Null)
    }
}

// ============================================================================
// Parsed Query
// ============================================================================

/// Parsed query, ready to run over a scan
#[derive(Debug, Clone)]
pub struct Query {
    /// Output columns
    pub columns: Vec<Column>,
    /// WHERE predicate
    pub condition: Option<Condition>,
    /// Keys to scan, narrowed by `start`/`end` params and `key` conjuncts
    pub range: KeyRange,
    /// How to decode values into fields
    pub format: ValueFormat,
    /// ORDER BY key DESC
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Projectable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Key,
    Value,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Key => "key",
            Column::Value => "value",
        }
    }
}

/// Value decoding for predicate evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueFormat {
    /// Split on `delimiter`; `fields` names the parts in order
    Delimited {
        delimiter: String,
        fields: Vec<String>,
    },
    /// Members of a top-level JSON object
    Json,
    /// Only `key` and `value`
    Raw,
}

pub(crate) const DEFAULT_DELIMITER: &str = "|";
pub(crate) const DEFAULT_FIELDS: &[&str] = &["category", "price", "name"];

impl Default for ValueFormat {
    fn default() -> Self {
        ValueFormat::Delimited {
            delimiter: DEFAULT_DELIMITER.to_string(),
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(QueryValue),
}

impl Operand {
    fn is_key_field(&self) -> bool {
        matches!(self, Operand::Field(name) if name.eq_ignore_ascii_case("key"))
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operator with its operands swapped (`5 < x` is `x > 5`)
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            op => op,
        }
    }
}

/// Predicate tree
#[derive(Debug, Clone)]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Between {
        operand: Operand,
        low: Operand,
        high: Operand,
        negated: bool,
    },
    In {
        operand: Operand,
        list: Vec<Operand>,
        negated: bool,
    },
    Like {
        operand: Operand,
        pattern: regex::Regex,
        negated: bool,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Key range implied by the top-level AND conjuncts on `key`.
    ///
    /// Only a narrowing hint: the full predicate is still evaluated on
    /// every scanned record.
    pub fn key_range(&self) -> KeyRange {
        use std::ops::Bound;

        match self {
            Condition::And(left, right) => left.key_range().intersect(&right.key_range()),
            Condition::Compare { left, op, right } => {
                let (op, literal) = if left.is_key_field() {
                    (*op, right)
                } else if right.is_key_field() {
                    (op.flip(), left)
                } else {
                    return KeyRange::full();
                };
                let key = match literal {
                    Operand::Literal(QueryValue::Integer(k)) => *k,
                    _ => return KeyRange::full(),
                };
                match op {
                    CompareOp::Eq => KeyRange::inclusive(key, key),
                    CompareOp::Lt => KeyRange::from_bounds((Bound::Unbounded, Bound::Excluded(key))),
                    CompareOp::Le => KeyRange::from_bounds(..=key),
                    CompareOp::Gt => KeyRange::from_bounds((Bound::Excluded(key), Bound::Unbounded)),
                    CompareOp::Ge => KeyRange::from_bounds(key..),
                    CompareOp::Ne => KeyRange::full(),
                }
            }
            Condition::Between {
                operand,
                low: Operand::Literal(QueryValue::Integer(low)),
                high: Operand::Literal(QueryValue::Integer(high)),
                negated: false,
            } if operand.is_key_field() => KeyRange::inclusive(*low, *high),
            _ => KeyRange::full(),
        }
    }
}
