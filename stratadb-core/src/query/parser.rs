//! SQL parser for StrataDB predicate queries
//!
//! Accepts a single-table SELECT or a bare predicate and lowers it into a
//! [`Query`]. Anything the executor cannot evaluate row by row (aggregates,
//! joins, grouping, set operations, ordering by a field) is rejected here so
//! the scan never starts.

use super::{
    Column, CompareOp, Condition, Operand, Query, QueryParams, QueryValue, ValueFormat,
    DEFAULT_DELIMITER, DEFAULT_FIELDS,
};
use crate::types::KeyRange;
use crate::{Result, StrataError};
use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, Query as SqlQuery, Select, SelectItem as SqlSelectItem,
    SetExpr, Statement as SqlStatement, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Params that configure the query rather than bind placeholders
const PARAM_FORMAT: &str = "format";
const PARAM_DELIMITER: &str = "delimiter";
const PARAM_FIELDS: &str = "fields";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";

fn parse_error(msg: impl Into<String>) -> StrataError {
    StrataError::QueryParse(msg.into())
}

/// SQL query parser
pub struct QueryParser<'a> {
    params: &'a QueryParams,
    /// Next `?` placeholder, bound to params "1", "2", ...
    positional: usize,
}

impl<'a> QueryParser<'a> {
    /// Parse a SELECT statement or bare predicate with its params
    pub fn parse(text: &str, params: &'a QueryParams) -> Result<Query> {
        let trimmed = text.trim().trim_end_matches(';');
        let sql = if trimmed.is_empty() {
            "SELECT * FROM t".to_string()
        } else if Self::is_select(trimmed) {
            trimmed.to_string()
        } else {
            format!("SELECT * FROM t WHERE {}", trimmed)
        };

        let dialect = GenericDialect {};
        let statements =
            Parser::parse_sql(&dialect, &sql).map_err(|e| parse_error(e.to_string()))?;
        if statements.len() != 1 {
            return Err(parse_error("Expected exactly one statement"));
        }

        let mut parser = QueryParser {
            params,
            positional: 0,
        };
        match &statements[0] {
            SqlStatement::Query(query) => parser.parse_query(query),
            _ => Err(parse_error("Only SELECT queries are supported")),
        }
    }

    fn is_select(sql: &str) -> bool {
        sql.split_whitespace()
            .next()
            .map_or(false, |word| word.eq_ignore_ascii_case("select"))
    }

    fn parse_query(&mut self, query: &SqlQuery) -> Result<Query> {
        if query.with.is_some() {
            return Err(parse_error("WITH clauses are not supported"));
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::SetOperation { .. } => {
                return Err(parse_error("Set operations are not supported"));
            }
            _ => return Err(parse_error("Unsupported query type")),
        };

        self.check_select(select)?;
        let columns = Self::parse_columns(select)?;
        let condition = match &select.selection {
            Some(expr) => Some(self.parse_condition(expr)?),
            None => None,
        };
        let descending = Self::parse_order_by(query)?;
        let limit = Self::parse_count(query.limit.as_ref(), "LIMIT")?;
        let offset = Self::parse_count(query.offset.as_ref().map(|o| &o.value), "OFFSET")?;

        let mut range = self.param_range()?;
        if let Some(condition) = &condition {
            range = range.intersect(&condition.key_range());
        }

        Ok(Query {
            columns,
            condition,
            range,
            format: self.parse_format()?,
            descending,
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    /// Reject clauses that need more than a single filtered scan
    fn check_select(&self, select: &Select) -> Result<()> {
        if select.distinct.is_some() {
            return Err(parse_error("DISTINCT is not supported"));
        }
        if select.from.len() > 1 || select.from.iter().any(|t| !t.joins.is_empty()) {
            return Err(parse_error("Joins are not supported"));
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs) if exprs.is_empty() => {}
            _ => return Err(parse_error("GROUP BY is not supported")),
        }
        if select.having.is_some() {
            return Err(parse_error("HAVING is not supported"));
        }
        Ok(())
    }

    fn parse_columns(select: &Select) -> Result<Vec<Column>> {
        let mut columns = Vec::new();
        for item in &select.projection {
            match item {
                SqlSelectItem::Wildcard(_) => {
                    columns.extend([Column::Key, Column::Value]);
                }
                SqlSelectItem::UnnamedExpr(expr) | SqlSelectItem::ExprWithAlias { expr, .. } => {
                    columns.push(Self::parse_column(expr)?);
                }
                _ => return Err(parse_error("Unsupported select item")),
            }
        }
        Ok(columns)
    }

    fn parse_column(expr: &Expr) -> Result<Column> {
        match Self::field_name(expr) {
            Some(name) if name.eq_ignore_ascii_case("key") => Ok(Column::Key),
            Some(name) if name.eq_ignore_ascii_case("value") => Ok(Column::Value),
            Some(name) => Err(parse_error(format!(
                "Only key and value can be selected, got {}",
                name
            ))),
            None => Err(parse_error(format!("Unsupported select expression: {}", expr))),
        }
    }

    /// Returns true for `ORDER BY key DESC`
    fn parse_order_by(query: &SqlQuery) -> Result<bool> {
        match query.order_by.as_slice() {
            [] => Ok(false),
            [item] if Self::field_name(&item.expr).map_or(false, |f| f.eq_ignore_ascii_case("key")) => {
                Ok(item.asc == Some(false))
            }
            _ => Err(parse_error("ORDER BY is only supported on key")),
        }
    }

    fn parse_count(expr: Option<&Expr>, clause: &str) -> Result<Option<usize>> {
        match expr {
            Some(Expr::Value(Value::Number(n, _))) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| parse_error(format!("Invalid {} value", clause))),
            Some(_) => Err(parse_error(format!("Unsupported {} expression", clause))),
            None => Ok(None),
        }
    }

    fn parse_condition(&mut self, expr: &Expr) -> Result<Condition> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And => Ok(Condition::And(
                    Box::new(self.parse_condition(left)?),
                    Box::new(self.parse_condition(right)?),
                )),
                BinaryOperator::Or => Ok(Condition::Or(
                    Box::new(self.parse_condition(left)?),
                    Box::new(self.parse_condition(right)?),
                )),
                _ => self.parse_comparison(left, op, right),
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Ok(Condition::Between {
                operand: self.parse_operand(expr)?,
                low: self.parse_operand(low)?,
                high: self.parse_operand(high)?,
                negated: *negated,
            }),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let operand = self.parse_operand(expr)?;
                let list = list
                    .iter()
                    .map(|e| self.parse_operand(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Condition::In {
                    operand,
                    list,
                    negated: *negated,
                })
            }
            Expr::IsNull(expr) => Ok(Condition::IsNull {
                operand: self.parse_operand(expr)?,
                negated: false,
            }),
            Expr::IsNotNull(expr) => Ok(Condition::IsNull {
                operand: self.parse_operand(expr)?,
                negated: true,
            }),
            Expr::Like {
                expr,
                pattern,
                negated,
                ..
            } => {
                let operand = self.parse_operand(expr)?;
                let pattern = match self.parse_operand(pattern)? {
                    Operand::Literal(QueryValue::String(s)) => s,
                    _ => return Err(parse_error("LIKE pattern must be a string")),
                };
                Ok(Condition::Like {
                    operand,
                    pattern: Self::like_regex(&pattern)?,
                    negated: *negated,
                })
            }
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Ok(Condition::Not(Box::new(self.parse_condition(expr)?))),
            Expr::Nested(inner) => self.parse_condition(inner),
            _ => Err(parse_error(format!("Unsupported WHERE expression: {}", expr))),
        }
    }

    fn parse_comparison(&mut self, left: &Expr, op: &BinaryOperator, right: &Expr) -> Result<Condition> {
        let op = match op {
            BinaryOperator::Eq => CompareOp::Eq,
            BinaryOperator::NotEq => CompareOp::Ne,
            BinaryOperator::Lt => CompareOp::Lt,
            BinaryOperator::LtEq => CompareOp::Le,
            BinaryOperator::Gt => CompareOp::Gt,
            BinaryOperator::GtEq => CompareOp::Ge,
            _ => return Err(parse_error(format!("Unsupported operator: {}", op))),
        };
        Ok(Condition::Compare {
            left: self.parse_operand(left)?,
            op,
            right: self.parse_operand(right)?,
        })
    }

    fn parse_operand(&mut self, expr: &Expr) -> Result<Operand> {
        match expr {
            // GenericDialect reads `@name` as an identifier
            Expr::Identifier(ident) if ident.value.starts_with('@') => {
                Ok(Operand::Literal(self.bind(&ident.value)?))
            }
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => match Self::field_name(expr) {
                Some(name) => Ok(Operand::Field(name)),
                None => Err(parse_error("Expected field name")),
            },
            Expr::Value(value) => Ok(Operand::Literal(self.parse_value(value)?)),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match self.parse_operand(expr)? {
                // `-9223372036854775808` arrives as the negation of a number past i64::MAX
                Operand::Literal(QueryValue::Float(_)) if Self::negated_min(expr) => {
                    Ok(Operand::Literal(QueryValue::Integer(i64::MIN)))
                }
                Operand::Literal(QueryValue::Integer(i)) => i
                    .checked_neg()
                    .map(|n| Operand::Literal(QueryValue::Integer(n)))
                    .ok_or_else(|| parse_error(format!("Integer overflow negating {}", i))),
                Operand::Literal(QueryValue::Float(f)) => Ok(Operand::Literal(QueryValue::Float(-f))),
                _ => Err(parse_error("Cannot negate non-numeric value")),
            },
            Expr::Nested(inner) => self.parse_operand(inner),
            _ => Err(parse_error(format!("Unsupported operand: {}", expr))),
        }
    }

    fn negated_min(expr: &Expr) -> bool {
        matches!(expr, Expr::Value(Value::Number(n, _)) if n.as_str() == "9223372036854775808")
    }

    fn parse_value(&mut self, value: &Value) -> Result<QueryValue> {
        match value {
            Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(QueryValue::Integer(i))
                } else {
                    n.parse::<f64>()
                        .map(QueryValue::Float)
                        .map_err(|_| parse_error(format!("Invalid number: {}", n)))
                }
            }
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Ok(QueryValue::String(s.clone()))
            }
            Value::Boolean(b) => Ok(QueryValue::Boolean(*b)),
            Value::Null => Ok(QueryValue::Null),
            Value::Placeholder(p) => self.bind(p),
            _ => Err(parse_error(format!("Unsupported value type: {}", value))),
        }
    }

    /// Resolve `$name`, `:name`, `@name` or `?` from the params
    fn bind(&mut self, placeholder: &str) -> Result<QueryValue> {
        let name = placeholder.trim_start_matches(|c| matches!(c, '$' | ':' | '@' | '?'));
        let name = if name.is_empty() {
            self.positional += 1;
            self.positional.to_string()
        } else {
            name.to_string()
        };
        self.params
            .get(&name)
            .map(|raw| QueryValue::infer(raw))
            .ok_or_else(|| parse_error(format!("No value bound for placeholder {}", placeholder)))
    }

    fn field_name(expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(ident) => Some(ident.value.clone()),
            // `t.price` names the field `price`
            Expr::CompoundIdentifier(parts) => parts.last().map(|ident| ident.value.clone()),
            _ => None,
        }
    }

    /// Translate a LIKE pattern (`%` any run, `_` any char) to an anchored regex
    fn like_regex(pattern: &str) -> Result<regex::Regex> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push_str("(?s)^");
        for c in pattern.chars() {
            match c {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
        }
        re.push('$');
        regex::Regex::new(&re).map_err(|e| parse_error(format!("Invalid LIKE pattern: {}", e)))
    }

    /// Scan bounds from the `start`/`end` params (both inclusive)
    fn param_range(&self) -> Result<KeyRange> {
        let bound = |name: &str| -> Result<Option<i64>> {
            match self.params.get(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| parse_error(format!("{} must be an integer key, got {:?}", name, raw))),
                None => Ok(None),
            }
        };
        let start = bound(PARAM_START)?;
        let end = bound(PARAM_END)?;
        Ok(match (start, end) {
            (Some(s), Some(e)) => KeyRange::inclusive(s, e),
            (Some(s), None) => KeyRange::from_bounds(s..),
            (None, Some(e)) => KeyRange::from_bounds(..=e),
            (None, None) => KeyRange::full(),
        })
    }

    fn parse_format(&self) -> Result<ValueFormat> {
        let format = self
            .params
            .get(PARAM_FORMAT)
            .map(|f| f.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "delimited".to_string());
        match format.as_str() {
            "delimited" => {
                let mut delimiter = DEFAULT_DELIMITER.to_string();
                let mut fields: Vec<String> =
                    DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect();
                if let Some(d) = self.params.get(PARAM_DELIMITER) {
                    if d.is_empty() {
                        return Err(parse_error("delimiter must not be empty"));
                    }
                    delimiter = d.clone();
                }
                if let Some(names) = self.params.get(PARAM_FIELDS) {
                    fields = names
                        .split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect();
                }
                Ok(ValueFormat::Delimited { delimiter, fields })
            }
            "json" => Ok(ValueFormat::Json),
            "raw" => Ok(ValueFormat::Raw),
            other => Err(parse_error(format!("Unknown value format: {}", other))),
        }
    }
}
