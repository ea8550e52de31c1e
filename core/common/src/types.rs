//! Common types used throughout tablesync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A single table row as a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Names of the columns the remote table service maintains on every record.
pub mod system_columns {
    /// Primary key column.
    pub const ID: &str = "id";
    /// Opaque concurrency token.
    pub const VERSION: &str = "version";
    /// Creation timestamp.
    pub const CREATED_AT: &str = "createdAt";
    /// Last modification timestamp, used as the pull watermark.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Tombstone flag.
    pub const DELETED: &str = "deleted";

    /// Columns the server owns; stripped before inserting a record remotely.
    pub const ALL: [&str; 4] = [VERSION, CREATED_AT, UPDATED_AT, DELETED];
}

/// Maximum length of a string record id.
const MAX_STRING_ID_LENGTH: usize = 255;

/// Identifier of a row in a local table.
///
/// Data records use string ids. Integer ids are only used by internal tables
/// such as the operation log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Extract an id from a JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(RecordId::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            _ => None,
        }
    }

    /// Convert back into the JSON value stored in the `id` column.
    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(i) => Value::from(*i),
            RecordId::Text(s) => Value::String(s.clone()),
        }
    }

    /// Key used by stores to index the row.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(i) => write!(f, "{}", i),
            RecordId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Text(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId::Text(value)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

/// Check that a string is acceptable as a record id.
///
/// # Errors
/// - Empty ids, ids longer than 255 characters, `.` and `..`
/// - Ids containing control characters or any of `+ " / ? \` \`
pub fn validate_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id.chars().count() > MAX_STRING_ID_LENGTH
        || id == "."
        || id == ".."
        || id.chars().any(|c| {
            matches!(c, '+' | '"' | '/' | '?' | '`' | '\\')
                || ('\u{0000}'..='\u{001F}').contains(&c)
                || ('\u{007F}'..='\u{009F}').contains(&c)
        });

    if invalid {
        return Err(Error::InvalidInput(format!("id \"{}\" is not valid", id)));
    }
    Ok(())
}

/// Read and validate the string id of a data record.
pub fn record_id(record: &Record) -> Result<String> {
    match record.get(system_columns::ID) {
        Some(Value::String(id)) => {
            validate_id(id)?;
            Ok(id.clone())
        }
        Some(other) => Err(Error::InvalidInput(format!("id {} is not valid", other))),
        None => Err(Error::InvalidInput("record has no id".to_string())),
    }
}

/// A local mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableAction {
    Insert,
    Update,
    Delete,
}

impl TableAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableAction::Insert => "insert",
            TableAction::Update => "update",
            TableAction::Delete => "delete",
        }
    }
}

impl fmt::Display for TableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(TableAction::Insert),
            "update" => Ok(TableAction::Update),
            "delete" | "del" => Ok(TableAction::Delete),
            other => Err(Error::InvalidInput(format!("Action {} not supported", other))),
        }
    }
}
