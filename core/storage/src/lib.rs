//! Local store abstraction for tablesync.
//!
//! This module provides the trait the sync engine uses to read and write
//! local tables, plus two implementations: an in-memory store for tests and
//! development, and a SQLite store for persistent use.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the sync engine
//! - Async operations: every call is an await point
//! - Atomic batches: multi-row writes are applied all-or-nothing

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{
    ColumnType, DeleteTarget, LocalStore, StoreAction, StoreOperation, TableDefinition,
};
