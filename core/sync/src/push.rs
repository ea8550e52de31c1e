//! Push: drain the operation log against the remote table service.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tablesync_common::{system_columns, Error, Result, TableAction};
use tablesync_storage::LocalStore;

use crate::config::SyncConfig;
use crate::operations::{OperationLog, PendingOperation};
use crate::push_error::{HandlerOutcome, PushError, PushHandler};
use crate::queue::SerialTaskQueue;
use crate::remote::{Feature, RemoteTableClient, RequestOptions};

/// Sends pending operations to the server, oldest first.
pub struct PushEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteTableClient>,
    operations: Arc<OperationLog>,
    store_queue: Arc<SerialTaskQueue>,
    queue: SerialTaskQueue,
    max_retries: u32,
}

impl PushEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteTableClient>,
        operations: Arc<OperationLog>,
        store_queue: Arc<SerialTaskQueue>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            operations,
            store_queue,
            queue: SerialTaskQueue::new("push"),
            max_retries: config.max_push_retries,
        }
    }

    /// Push every pending operation.
    ///
    /// Failures are passed to `handler`. A conflict nobody resolves is
    /// collected and pushing continues with the next operation; any other
    /// unresolved failure stops the push.
    ///
    /// # Returns
    /// The unresolved conflicts, in the order they occurred.
    ///
    /// # Errors
    /// - `Error::PushAborted` for an unresolved non-conflict failure
    /// - Local store failures
    pub async fn push(&self, handler: Option<&dyn PushHandler>) -> Result<Vec<PushError>> {
        self.queue.run(self.push_all(handler)).await
    }

    async fn push_all(&self, handler: Option<&dyn PushHandler>) -> Result<Vec<PushError>> {
        info!("Starting push");

        let mut conflicts = Vec::new();
        let mut pushed = 0usize;
        let mut last_processed_id: i64 = -1;
        let mut last_failed_id: i64 = -1;
        let mut retry_count: u32 = 0;

        loop {
            let pending = match self.read_and_lock(last_processed_id).await? {
                Some(pending) => pending,
                None => break,
            };
            let id = pending.log_record.id;

            let error = match self.push_operation(&pending).await {
                Ok(()) => {
                    self.store_queue
                        .run(self.operations.remove_locked_operation())
                        .await?;
                    last_processed_id = id;
                    pushed += 1;
                    continue;
                }
                Err(err) => err,
            };

            self.store_queue
                .run(self.operations.unlock_operation())
                .await;

            let push_error = PushError::new(
                pending,
                error,
                self.store.clone(),
                self.operations.clone(),
                self.store_queue.clone(),
            );

            if last_failed_id != id {
                last_failed_id = id;
                retry_count = 0;
            }

            let outcome = if retry_count < self.max_retries {
                retry_count += 1;
                self.handle_error(handler, &push_error).await
            } else {
                debug!(
                    "Retry limit reached for operation {}, treating failure as unhandled",
                    id
                );
                HandlerOutcome::Unhandled
            };

            match outcome {
                // Re-read the same operation; the handler may have changed or removed it.
                HandlerOutcome::Handled => {}
                HandlerOutcome::Unhandled if push_error.is_conflict() => {
                    warn!(
                        "Unresolved conflict for {}/{} ({})",
                        push_error.table_name(),
                        push_error.item_id(),
                        push_error.action()
                    );
                    last_processed_id = id;
                    conflicts.push(push_error);
                }
                HandlerOutcome::Unhandled => {
                    error!(
                        "Push aborted on {}/{}: {}",
                        push_error.table_name(),
                        push_error.item_id(),
                        push_error.error()
                    );
                    return Err(Error::PushAborted {
                        table: push_error.table_name().to_string(),
                        action: push_error.action(),
                        item_id: push_error.item_id().to_string(),
                        source: Box::new(push_error.into_error()),
                    });
                }
            }
        }

        info!(
            "Push complete: {} pushed, {} unresolved conflicts",
            pushed,
            conflicts.len()
        );
        Ok(conflicts)
    }

    async fn read_and_lock(&self, last_processed_id: i64) -> Result<Option<PendingOperation>> {
        self.store_queue
            .run(async {
                let pending = self
                    .operations
                    .read_first_pending_operation_with_data(last_processed_id)
                    .await?;
                if let Some(pending) = &pending {
                    self.operations
                        .lock_operation(pending.log_record.id)
                        .await?;
                }
                Ok::<_, Error>(pending)
            })
            .await
    }

    async fn handle_error(
        &self,
        handler: Option<&dyn PushHandler>,
        push_error: &PushError,
    ) -> HandlerOutcome {
        let handler = match handler {
            Some(handler) => handler,
            None => return HandlerOutcome::Unhandled,
        };

        let result = if push_error.is_conflict() {
            handler.on_conflict(push_error).await
        } else {
            handler.on_error(push_error).await
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    "Push handler failed for {}/{}: {}",
                    push_error.table_name(),
                    push_error.item_id(),
                    err
                );
                HandlerOutcome::Unhandled
            }
        }
    }

    async fn push_operation(&self, pending: &PendingOperation) -> Result<()> {
        let log_record = &pending.log_record;
        let table = log_record.table_name.as_str();
        let options = RequestOptions::with_features([Feature::OfflineSync]);

        match log_record.action {
            TableAction::Insert => {
                let mut data = pending.data.clone().ok_or_else(|| {
                    Error::NotFound(format!("No data for insert of {}/{}", table, log_record.item_id))
                })?;
                for column in system_columns::ALL {
                    data.remove(column);
                }

                let result = self.remote.insert(table, data, &options).await?;
                self.store_queue
                    .run(self.store.upsert(table, result))
                    .await?;
            }
            TableAction::Update => {
                let data = pending.data.clone().ok_or_else(|| {
                    Error::NotFound(format!("No data for update of {}/{}", table, log_record.item_id))
                })?;

                let result = self.remote.update(table, data, &options).await?;
                self.store_queue
                    .run(self.store.upsert(table, result))
                    .await?;
            }
            TableAction::Delete => {
                self.remote
                    .del(
                        table,
                        &log_record.item_id,
                        log_record.metadata.version.as_deref(),
                        &options,
                    )
                    .await?;
            }
        }

        debug!("Pushed {} of {}/{}", log_record.action, table, log_record.item_id);
        Ok(())
    }
}
