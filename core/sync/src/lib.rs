//! TableSync Sync Engine
//!
//! This module provides offline synchronization of table data, including:
//! - Local CRUD with an operation log of pending changes
//! - Push of pending changes with conflict handling
//! - Incremental, paged pull into the local store
//! - Purge of local table data and sync state

pub mod config;
pub mod context;
pub mod operations;
pub mod pull;
pub mod purge;
pub mod push;
pub mod push_error;
pub mod queue;
pub mod remote;
pub mod schema;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::SyncConfig;
pub use context::SyncContext;
pub use operations::{
    condense_action, CondenseAction, LogRecord, MetadataAction, OperationLog,
    OperationMetadata, PendingOperation,
};
pub use pull::{PullEngine, PullSettings, PullStats};
pub use purge::PurgeEngine;
pub use push::PushEngine;
pub use push_error::{HandlerOutcome, PushError, PushHandler};
pub use queue::SerialTaskQueue;
pub use remote::{Feature, RemoteTableClient, RequestOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _settings = PullSettings::default();
        let _options = RequestOptions::default();
        let _queue = SerialTaskQueue::new("exports");
    }
}
