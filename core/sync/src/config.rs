//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};

use tablesync_common::{Error, Result};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Records requested per pull page when the caller does not set one.
    pub default_page_size: usize,
    /// Handler invocations allowed for a single log row during one push.
    pub max_push_retries: u32,
    /// Name of the operation-log table.
    pub operation_table: String,
    /// Name of the incremental-pull watermark table.
    pub pulltime_table: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_push_retries: 5,
            operation_table: "__operations".to_string(),
            pulltime_table: "__pulltime".to_string(),
        }
    }
}

impl SyncConfig {
    /// Set the default pull page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.default_page_size = page_size;
        self
    }

    /// Set the push retry cap.
    pub fn with_max_push_retries(mut self, retries: u32) -> Self {
        self.max_push_retries = retries;
        self
    }

    /// Set the operation-log table name.
    pub fn with_operation_table(mut self, name: impl Into<String>) -> Self {
        self.operation_table = name.into();
        self
    }

    /// Set the watermark table name.
    pub fn with_pulltime_table(mut self, name: impl Into<String>) -> Self {
        self.pulltime_table = name.into();
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 {
            return Err(Error::InvalidInput(
                "default page size must be greater than zero".to_string(),
            ));
        }
        if self.operation_table.is_empty() || self.pulltime_table.is_empty() {
            return Err(Error::InvalidInput(
                "sync table names cannot be empty".to_string(),
            ));
        }
        if self.operation_table == self.pulltime_table {
            return Err(Error::InvalidInput(
                "operation and pulltime tables must differ".to_string(),
            ));
        }
        Ok(())
    }
}
