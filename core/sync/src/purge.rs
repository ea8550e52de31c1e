//! Purge: remove a table's local data together with its sync state.

use std::sync::Arc;
use tracing::info;

use tablesync_common::{system_columns, Error, Query, RecordId, Result};
use tablesync_storage::{DeleteTarget, LocalStore};

use crate::config::SyncConfig;
use crate::queue::SerialTaskQueue;
use crate::schema::{operation_columns, pulltime_columns};

/// Deletes local records, pending operations and pull watermarks of a table.
pub struct PurgeEngine {
    store: Arc<dyn LocalStore>,
    store_queue: Arc<SerialTaskQueue>,
    operation_table: String,
    pulltime_table: String,
}

impl PurgeEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        store_queue: Arc<SerialTaskQueue>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            store_queue,
            operation_table: config.operation_table.clone(),
            pulltime_table: config.pulltime_table.clone(),
        }
    }

    /// Purge the records of `query.table` selected by `query`.
    ///
    /// A regular purge refuses to run while the table has pending operations.
    /// A forced purge discards them. Either way every watermark of the table
    /// is removed, so the next incremental pull starts from scratch.
    ///
    /// # Errors
    /// - `Error::PendingOperations` for a regular purge of a table with
    ///   pending operations; nothing is changed
    /// - Local store failures; steps already applied are not rolled back
    pub async fn purge(&self, query: &Query, force: bool) -> Result<()> {
        self.store_queue
            .run(async {
                let table = query.table.as_str();
                if table.is_empty() {
                    return Err(Error::InvalidInput("table name cannot be empty".to_string()));
                }

                let pending = Query::new(&self.operation_table)
                    .where_eq(operation_columns::TABLE_NAME, table);
                if force {
                    self.store
                        .del(&self.operation_table, DeleteTarget::Query(pending))
                        .await?;
                } else if !self.store.read(&pending).await?.is_empty() {
                    return Err(Error::PendingOperations(table.to_string()));
                }

                let watermarks = Query::new(&self.pulltime_table)
                    .where_eq(pulltime_columns::TABLE_NAME, table);
                self.store
                    .del(&self.pulltime_table, DeleteTarget::Query(watermarks))
                    .await?;

                // Select whole records so ordering, skip and take are honoured.
                let mut selector = query.clone();
                selector.selections.clear();
                let ids: Vec<RecordId> = self
                    .store
                    .read(&selector)
                    .await?
                    .iter()
                    .filter_map(|r| r.get(system_columns::ID).and_then(RecordId::from_value))
                    .collect();
                let purged = ids.len();
                self.store.del(table, DeleteTarget::Ids(ids)).await?;

                info!(
                    "Purged {} records from {}{}",
                    purged,
                    table,
                    if force { " (forced)" } else { "" }
                );
                Ok::<_, Error>(())
            })
            .await
    }
}
