//! Common types shared across the tablesync crates.
//!
//! This crate holds the foundational vocabulary of the sync engine: the
//! error type, record and id types, the names of the system columns a remote
//! table maintains, and the query model used both against the local store and
//! the remote table service.

pub mod error;
pub mod query;
pub mod types;

pub use error::{Error, RemoteError, Result};
pub use query::{format_timestamp, parse_timestamp, Comparison, Filter, Literal, OrderBy, Query};
pub use types::{record_id, system_columns, validate_id, Record, RecordId, TableAction};
