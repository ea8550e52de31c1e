//! Local store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tablesync_common::{system_columns, Error, Query, Record, RecordId, Result};

/// Logical type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Date,
    Object,
}

/// Shape of a local table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Declared columns. Must include `id`.
    pub columns: BTreeMap<String, ColumnType>,
    /// Column lists stores may index for lookups.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

impl TableDefinition {
    /// Start a definition with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: BTreeMap::new(),
            indexes: Vec::new(),
        }
    }

    /// Declare a column.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    /// Declare an index over the given columns, most significant first.
    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Check the definition can be created.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("table name cannot be empty".to_string()));
        }
        if !self.columns.contains_key(system_columns::ID) {
            return Err(Error::InvalidInput(format!(
                "table '{}' must declare an id column",
                self.name
            )));
        }
        for index in &self.indexes {
            if index.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "index on table '{}' has no columns",
                    self.name
                )));
            }
            if let Some(column) = index
                .iter()
                .find(|c| !self.columns.contains_key(*c) || !is_simple_field(c))
            {
                return Err(Error::InvalidInput(format!(
                    "cannot index column '{}' of table '{}'",
                    column, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Whether a field name is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub(crate) fn is_simple_field(field: &str) -> bool {
    let mut chars = field.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A single write within a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// Insert the record or update the columns it carries.
    Upsert(Record),
    /// Remove the record with the given id, if present.
    Delete(RecordId),
}

/// A write against one table, as submitted to [`LocalStore::execute_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOperation {
    pub table: String,
    pub action: StoreAction,
}

impl StoreOperation {
    pub fn upsert(table: impl Into<String>, record: Record) -> Self {
        Self {
            table: table.into(),
            action: StoreAction::Upsert(record),
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            table: table.into(),
            action: StoreAction::Delete(id.into()),
        }
    }
}

/// Selection of rows to delete.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    /// Rows with these ids.
    Ids(Vec<RecordId>),
    /// Rows matching the query's filters. Must target the same table.
    Query(Query),
}

/// Persistent local store the sync engine reads from and writes to.
///
/// Implementations must be safe to share between tasks. The engine serializes
/// its own access, so stores only need to keep each call internally
/// consistent.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Create the table if it does not exist yet.
    ///
    /// # Errors
    /// - Empty table name or no `id` column
    async fn define_table(&self, definition: &TableDefinition) -> Result<()>;

    /// Read the records of `query.table` matching the query.
    ///
    /// # Errors
    /// - Table not defined
    async fn read(&self, query: &Query) -> Result<Vec<Record>>;

    /// Look up a single record.
    ///
    /// # Errors
    /// - Table not defined
    /// - Record missing and `suppress_not_found` is false
    async fn lookup(
        &self,
        table: &str,
        id: &RecordId,
        suppress_not_found: bool,
    ) -> Result<Option<Record>>;

    /// Insert a record or update the columns it carries.
    ///
    /// # Postconditions
    /// - Returns the stored record
    ///
    /// # Errors
    /// - Table not defined
    /// - Record has no usable `id`
    async fn upsert(&self, table: &str, record: Record) -> Result<Record>;

    /// Delete records. Missing ids are ignored.
    ///
    /// # Errors
    /// - Table not defined
    /// - Query targets a different table
    async fn del(&self, table: &str, target: DeleteTarget) -> Result<()>;

    /// Apply several writes atomically, in order.
    ///
    /// # Postconditions
    /// - Either every operation is applied or none is
    async fn execute_batch(&self, operations: Vec<StoreOperation>) -> Result<()>;
}

/// Extract the row id of a record about to be written.
pub(crate) fn row_id(table: &str, record: &Record) -> Result<RecordId> {
    record
        .get(system_columns::ID)
        .and_then(RecordId::from_value)
        .ok_or_else(|| {
            Error::InvalidInput(format!("record written to '{}' has no usable id", table))
        })
}

/// Check a delete query targets the table being deleted from.
pub(crate) fn check_delete_query(table: &str, query: &Query) -> Result<()> {
    if query.table != table {
        return Err(Error::InvalidInput(format!(
            "delete query targets '{}' but table is '{}'",
            query.table, table
        )));
    }
    Ok(())
}

/// Overlay the columns of `update` onto `existing`.
pub(crate) fn merge(existing: Option<Record>, update: Record) -> Record {
    match existing {
        Some(mut merged) => {
            merged.extend(update);
            merged
        }
        None => update,
    }
}
