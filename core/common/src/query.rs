//! Query model shared by the local store and the remote table service.
//!
//! A [`Query`] targets one table and carries AND-ed comparison filters,
//! ordering, paging, field selection and a total-count flag. Local stores
//! evaluate it with [`Query::apply`]; remote clients render it with
//! [`Query::to_odata`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use crate::types::Record;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn odata(&self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
        }
    }

    fn holds(&self, ordering: Option<Ordering>) -> bool {
        match self {
            Comparison::Eq => ordering == Some(Ordering::Equal),
            Comparison::Ne => ordering != Some(Ordering::Equal),
            Comparison::Gt => ordering == Some(Ordering::Greater),
            Comparison::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Comparison::Lt => ordering == Some(Ordering::Less),
            Comparison::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Plain JSON value.
    Value(Value),
    /// Timestamp; matched against RFC 3339 strings in records.
    DateTime(DateTime<Utc>),
}

impl From<Value> for Literal {
    fn from(value: Value) -> Self {
        Literal::Value(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Value(Value::String(value))
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Value(Value::from(value))
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Value(Value::Bool(value))
    }
}

impl From<DateTime<Utc>> for Literal {
    fn from(value: DateTime<Utc>) -> Self {
        Literal::DateTime(value)
    }
}

/// A single `field <op> literal` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub comparison: Comparison,
    pub literal: Literal,
}

impl Filter {
    /// Check the predicate against a record. Missing fields compare as `null`.
    pub fn matches(&self, record: &Record) -> bool {
        let field = record.get(&self.field).unwrap_or(&Value::Null);
        let ordering = match &self.literal {
            Literal::Value(value) => compare_values(field, value),
            Literal::DateTime(expected) => parse_timestamp(field).map(|actual| actual.cmp(expected)),
        };
        self.comparison.holds(ordering)
    }

    fn to_odata(&self) -> String {
        format!(
            "({} {} {})",
            self.field,
            self.comparison.odata(),
            literal_to_odata(&self.literal)
        )
    }
}

/// Sort key of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// Query against a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Target table.
    pub table: String,
    /// Predicates, all of which must hold.
    pub filters: Vec<Filter>,
    /// Sort keys, most significant first.
    pub ordering: Vec<OrderBy>,
    /// Number of leading results to drop.
    pub skip: Option<usize>,
    /// Maximum number of results.
    pub take: Option<usize>,
    /// Fields to project; empty keeps the whole record.
    pub selections: Vec<String>,
    /// Whether the caller asked for the total count of matching records.
    pub include_total_count: bool,
}

impl Query {
    /// Create a query that matches every record of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            ordering: Vec::new(),
            skip: None,
            take: None,
            selections: Vec::new(),
            include_total_count: false,
        }
    }

    /// Add a predicate.
    pub fn filter(
        mut self,
        field: impl Into<String>,
        comparison: Comparison,
        literal: impl Into<Literal>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            comparison,
            literal: literal.into(),
        });
        self
    }

    /// Add an equality predicate.
    pub fn where_eq(self, field: impl Into<String>, literal: impl Into<Literal>) -> Self {
        self.filter(field, Comparison::Eq, literal)
    }

    /// Sort ascending by `field`.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.ordering.push(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    /// Sort descending by `field`.
    pub fn order_by_descending(mut self, field: impl Into<String>) -> Self {
        self.ordering.push(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Skip the first `count` results.
    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    /// Return at most `count` results.
    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    /// Project the given fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selections = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Ask for the total count of matching records.
    pub fn with_total_count(mut self) -> Self {
        self.include_total_count = true;
        self
    }

    /// Whether a record satisfies every filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Evaluate the query over an in-memory set of records.
    pub fn apply<I>(&self, records: I) -> Vec<Record>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut results: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();

        if !self.ordering.is_empty() {
            results.sort_by(|a, b| {
                for key in &self.ordering {
                    let left = a.get(&key.field).unwrap_or(&Value::Null);
                    let right = b.get(&key.field).unwrap_or(&Value::Null);
                    let ordering = sort_values(left, right);
                    let ordering = if key.descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0);
        let take = self.take.unwrap_or(usize::MAX);

        results
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|record| self.project(record))
            .collect()
    }

    fn project(&self, record: Record) -> Record {
        if self.selections.is_empty() {
            return record;
        }
        record
            .into_iter()
            .filter(|(key, _)| self.selections.iter().any(|s| s == key))
            .collect()
    }

    /// Render the query as an OData query string (without the table path).
    pub fn to_odata(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());

        if !self.filters.is_empty() {
            let filter = self
                .filters
                .iter()
                .map(Filter::to_odata)
                .collect::<Vec<_>>()
                .join(" and ");
            serializer.append_pair("$filter", &filter);
        }

        if !self.ordering.is_empty() {
            let order = self
                .ordering
                .iter()
                .map(|o| {
                    if o.descending {
                        format!("{} desc", o.field)
                    } else {
                        o.field.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            serializer.append_pair("$orderby", &order);
        }

        if let Some(skip) = self.skip {
            serializer.append_pair("$skip", &skip.to_string());
        }
        if let Some(take) = self.take {
            serializer.append_pair("$top", &take.to_string());
        }
        if !self.selections.is_empty() {
            serializer.append_pair("$select", &self.selections.join(","));
        }
        if self.include_total_count {
            serializer.append_pair("$inlinecount", "allpages");
        }

        serializer.finish()
    }
}

/// Parse an RFC 3339 timestamp stored in a record field.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render a timestamp the way records store it.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// Nulls sort first; values of unrelated types keep their relative order.
fn sort_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        // Timestamps in different RFC 3339 spellings sort chronologically.
        (Value::String(_), Value::String(_)) => {
            match (parse_timestamp(left), parse_timestamp(right)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => compare_values(left, right).unwrap_or(Ordering::Equal),
            }
        }
        _ => compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

fn literal_to_odata(literal: &Literal) -> String {
    match literal {
        Literal::DateTime(dt) => format!("datetimeoffset'{}'", format_timestamp(dt)),
        Literal::Value(Value::String(s)) => format!("'{}'", s.replace('\'', "''")),
        Literal::Value(Value::Null) => "null".to_string(),
        Literal::Value(Value::Bool(b)) => b.to_string(),
        Literal::Value(Value::Number(n)) => n.to_string(),
        Literal::Value(other) => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}
