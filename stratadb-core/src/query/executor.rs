//! Query executor: filters a range scan with a parsed predicate

use super::{
    Column, CompareOp, Condition, Operand, Query, QueryResult, QueryRow, QueryValue, ValueFormat,
};
use crate::types::Key;
use crate::Result;
use bytes::Bytes;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Instant;
use tracing::debug;

/// Executes parsed queries
pub struct QueryExecutor;

impl QueryExecutor {
    /// Run `query` over `rows`, the live records of `query.range` in key order.
    ///
    /// Every scanned record is decoded and tested; without ORDER BY DESC the
    /// scan stops as soon as LIMIT is satisfied.
    pub fn execute<I>(query: &Query, rows: I) -> Result<QueryResult>
    where
        I: IntoIterator<Item = Result<(Key, Bytes)>>,
    {
        let start = Instant::now();
        let mut scanned = 0;
        let mut matched: Vec<QueryRow> = Vec::new();
        let mut skipped = 0;

        for row in rows {
            let (key, value) = row?;
            scanned += 1;

            let record = DecodedRecord::new(key, &value, &query.format);
            if !Self::matches(query.condition.as_ref(), &record) {
                continue;
            }

            if query.descending {
                matched.push(Self::project(query, key, &value));
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            matched.push(Self::project(query, key, &value));
            if query.limit.map_or(false, |limit| matched.len() >= limit) {
                break;
            }
        }

        if query.descending {
            matched.reverse();
            matched = matched
                .into_iter()
                .skip(query.offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .collect();
        }

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Query over {} scanned {} records, matched {} in {:.3}ms",
            query.range,
            scanned,
            matched.len(),
            elapsed
        );

        Ok(QueryResult {
            columns: query.columns.iter().map(|c| c.name().to_string()).collect(),
            rows: matched,
            scanned,
            execution_time_ms: elapsed,
        })
    }

    fn project(query: &Query, key: Key, value: &Bytes) -> QueryRow {
        let mut row = QueryRow {
            key: None,
            value: None,
        };
        for column in &query.columns {
            match column {
                Column::Key => row.key = Some(key),
                Column::Value => row.value = Some(String::from_utf8_lossy(value).into_owned()),
            }
        }
        row
    }

    fn matches(condition: Option<&Condition>, record: &DecodedRecord<'_>) -> bool {
        match condition {
            Some(condition) => Self::evaluate(condition, record) == Some(true),
            None => true,
        }
    }

    /// Three-valued evaluation: `None` is SQL UNKNOWN (a NULL was compared)
    fn evaluate(condition: &Condition, record: &DecodedRecord<'_>) -> Option<bool> {
        match condition {
            Condition::Compare { left, op, right } => {
                let ordering = Self::compare(&record.resolve(left), &record.resolve(right))?;
                Some(match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                })
            }
            Condition::Between {
                operand,
                low,
                high,
                negated,
            } => {
                let value = record.resolve(operand);
                let above = Self::compare(&value, &record.resolve(low))? != Ordering::Less;
                let below = Self::compare(&value, &record.resolve(high))? != Ordering::Greater;
                Some((above && below) != *negated)
            }
            Condition::In {
                operand,
                list,
                negated,
            } => {
                let value = record.resolve(operand);
                if value.is_null() {
                    return None;
                }
                let mut unknown = false;
                for candidate in list {
                    match Self::compare(&value, &record.resolve(candidate)) {
                        Some(Ordering::Equal) => return Some(!*negated),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(*negated)
                }
            }
            Condition::Like {
                operand,
                pattern,
                negated,
            } => {
                let text = record.resolve(operand).as_string()?;
                Some(pattern.is_match(&text) != *negated)
            }
            Condition::IsNull { operand, negated } => {
                Some(record.resolve(operand).is_null() != *negated)
            }
            Condition::And(left, right) => {
                match (Self::evaluate(left, record), Self::evaluate(right, record)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            }
            Condition::Or(left, right) => {
                match (Self::evaluate(left, record), Self::evaluate(right, record)) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            }
            Condition::Not(inner) => Self::evaluate(inner, record).map(|b| !b),
        }
    }

    /// Numeric when both sides are numbers, otherwise by text; NULL never compares.
    /// Two integers compare exactly, so keys past 2^53 stay distinct.
    fn compare(left: &QueryValue, right: &QueryValue) -> Option<Ordering> {
        if left.is_null() || right.is_null() {
            return None;
        }
        if let (Some(l), Some(r)) = (left.as_key(), right.as_key()) {
            return Some(l.cmp(&r));
        }
        if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
            return l.partial_cmp(&r);
        }
        Some(left.as_string()?.cmp(&right.as_string()?))
    }
}

/// A record's value decoded into named fields
struct DecodedRecord<'a> {
    key: Key,
    text: Cow<'a, str>,
    fields: Fields<'a>,
}

enum Fields<'a> {
    Delimited {
        names: &'a [String],
        parts: Vec<String>,
    },
    Json(Option<serde_json::Map<String, serde_json::Value>>),
    None,
}

impl<'a> DecodedRecord<'a> {
    fn new(key: Key, value: &'a [u8], format: &'a ValueFormat) -> Self {
        let text = String::from_utf8_lossy(value);
        let fields = match format {
            ValueFormat::Delimited { delimiter, fields } => Fields::Delimited {
                names: fields,
                parts: text.split(delimiter.as_str()).map(str::to_string).collect(),
            },
            ValueFormat::Json => match serde_json::from_slice(value) {
                Ok(serde_json::Value::Object(map)) => Fields::Json(Some(map)),
                _ => Fields::Json(None),
            },
            ValueFormat::Raw => Fields::None,
        };
        Self { key, text, fields }
    }

    fn resolve(&self, operand: &Operand) -> QueryValue {
        match operand {
            Operand::Literal(value) => value.clone(),
            Operand::Field(name) => self.field(name),
        }
    }

    /// Field by name; missing fields are NULL
    fn field(&self, name: &str) -> QueryValue {
        if name.eq_ignore_ascii_case("key") {
            return QueryValue::Integer(self.key);
        }
        if name.eq_ignore_ascii_case("value") {
            return QueryValue::String(self.text.to_string());
        }
        match &self.fields {
            Fields::Delimited { names, parts } => {
                let index = names.iter().position(|n| n == name).or_else(|| {
                    // positional f0, f1, ...
                    name.strip_prefix('f').and_then(|i| i.parse::<usize>().ok())
                });
                index
                    .and_then(|i| parts.get(i))
                    .map(|part| QueryValue::String(part.clone()))
                    .unwrap_or(QueryValue::Null)
            }
            Fields::Json(Some(map)) => map.get(name).map(json_to_value).unwrap_or(QueryValue::Null),
            Fields::Json(None) | Fields::None => QueryValue::Null,
        }
    }
}

fn json_to_value(value: &serde_json::Value) -> QueryValue {
    match value {
        serde_json::Value::Null => QueryValue::Null,
        serde_json::Value::Bool(b) => QueryValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => QueryValue::Integer(i),
            None => n.as_f64().map(QueryValue::Float).unwrap_or(QueryValue::Null),
        },
        serde_json::Value::String(s) => QueryValue::String(s.clone()),
        other => QueryValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryParams, QueryParser};

    fn products() -> Vec<Result<(Key, Bytes)>> {
        (1..=20)
            .map(|i| {
                let category = ["electronics", "books", "home", "toys"][(i % 4) as usize];
                let value = format!("{}|{}.99|Product {}", category, 10 + i, i);
                Ok((i, Bytes::from(value)))
            })
            .collect()
    }

    fn run(sql: &str, params: &[(&str, &str)]) -> QueryResult {
        let params: QueryParams = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let query = QueryParser::parse(sql, &params).unwrap();
        let rows = products()
            .into_iter()
            .filter(|r| r.as_ref().map_or(true, |(k, _)| query.range.contains(*k)));
        QueryExecutor::execute(&query, rows).unwrap()
    }

    fn keys(result: &QueryResult) -> Vec<Key> {
        result.rows.iter().filter_map(|r| r.key).collect()
    }

    #[test]
    fn test_delimited_fields() {
        let result = run("category = 'books' AND price < 25", &[]);
        assert_eq!(keys(&result), vec![1, 5, 9, 13]);
        assert_eq!(result.scanned, 20);
        assert_eq!(result.rows[0].value.as_deref(), Some("books|11.99|Product 1"));
    }

    #[test]
    fn test_numeric_vs_string_comparison() {
        // 9.99 < 10 numerically even though "9" > "1" as text
        let rows = vec![
            Ok((1, Bytes::from("a|9.99|x"))),
            Ok((2, Bytes::from("a|10.5|y"))),
        ];
        let query = QueryParser::parse("price < 10", &QueryParams::new()).unwrap();
        let result = QueryExecutor::execute(&query, rows).unwrap();
        assert_eq!(keys(&result), vec![1]);
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let rows = || {
            vec![
                Ok((9_007_199_254_740_992, Bytes::from("a|1|x"))),
                Ok((9_007_199_254_740_993, Bytes::from("a|2|y"))),
            ]
        };
        let params = QueryParams::new();
        for sql in ["key IN (9007199254740993)", "key = 9007199254740993 OR price > 5"] {
            let query = QueryParser::parse(sql, &params).unwrap();
            let result = QueryExecutor::execute(&query, rows()).unwrap();
            assert_eq!(keys(&result), vec![9_007_199_254_740_993], "{}", sql);
        }

        let query = QueryParser::parse("key != 9007199254740992", &params).unwrap();
        let result = QueryExecutor::execute(&query, rows()).unwrap();
        assert_eq!(keys(&result), vec![9_007_199_254_740_993]);

        // fractional operands still compare numerically
        let query = QueryParser::parse("key > 9007199254740992.5", &params).unwrap();
        assert_eq!(QueryExecutor::execute(&query, rows()).unwrap().rows.len(), 0);
    }

    #[test]
    fn test_like_in_between_not() {
        assert_eq!(keys(&run("name LIKE 'Product 1_'", &[])), (10..=19).collect::<Vec<_>>());
        assert_eq!(keys(&run("category IN ('toys', 'home') AND key < 8", &[])), vec![2, 3, 6, 7]);
        assert_eq!(keys(&run("price BETWEEN 12 AND 14", &[])), vec![2, 3]);
        assert_eq!(keys(&run("NOT (key > 3)", &[])), vec![1, 2, 3]);
        assert_eq!(keys(&run("f0 = 'electronics' AND key <= 8", &[])), vec![4, 8]);
    }

    #[test]
    fn test_missing_field_is_null() {
        assert!(run("discount > 1", &[]).rows.is_empty());
        // NOT of an unknown comparison stays unknown
        assert!(run("NOT discount > 1", &[]).rows.is_empty());
        assert_eq!(run("discount IS NULL", &[]).rows.len(), 20);
        assert!(run("f7 IS NOT NULL", &[]).rows.is_empty());
    }

    #[test]
    fn test_limit_offset_and_descending() {
        let result = run("SELECT key FROM t LIMIT 3 OFFSET 2", &[]);
        assert_eq!(keys(&result), vec![3, 4, 5]);
        // stopped early
        assert_eq!(result.scanned, 5);
        assert!(result.rows.iter().all(|r| r.value.is_none()));

        let result = run("SELECT * FROM t ORDER BY key DESC LIMIT 2", &[]);
        assert_eq!(keys(&result), vec![20, 19]);
        assert_eq!(result.columns, vec!["key", "value"]);
    }

    #[test]
    fn test_range_params() {
        let result = run("SELECT * FROM t", &[("start", "5"), ("end", "7")]);
        assert_eq!(keys(&result), vec![5, 6, 7]);
        assert_eq!(result.scanned, 3);
    }

    #[test]
    fn test_json_values() {
        let rows = vec![
            Ok((1, Bytes::from(r#"{"name":"lamp","price":25,"tags":["a"]}"#))),
            Ok((2, Bytes::from(r#"{"name":"desk","price":120.5}"#))),
            Ok((3, Bytes::from("not json"))),
        ];
        let mut params = QueryParams::new();
        params.insert("format".into(), "json".into());
        let query = QueryParser::parse("price > 100 OR name = 'lamp'", &params).unwrap();
        let result = QueryExecutor::execute(&query, rows).unwrap();
        assert_eq!(keys(&result), vec![1, 2]);
    }

    #[test]
    fn test_raw_format_only_key_and_value() {
        let rows = vec![Ok((1, Bytes::from("a|b"))), Ok((2, Bytes::from("hello")))];
        let mut params = QueryParams::new();
        params.insert("format".into(), "raw".into());
        let query = QueryParser::parse("value LIKE 'hel%' OR category = 'a'", &params).unwrap();
        let result = QueryExecutor::execute(&query, rows).unwrap();
        assert_eq!(keys(&result), vec![2]);
    }

    #[test]
    fn test_scan_error_propagates() {
        let rows = vec![
            Ok((1, Bytes::from("a|1|x"))),
            Err(crate::StrataError::Corruption("bad block".into())),
        ];
        let query = QueryParser::parse("", &QueryParams::new()).unwrap();
        assert!(QueryExecutor::execute(&query, rows).unwrap_err().is_corruption());
    }
}
