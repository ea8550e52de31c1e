//! Push failures and the handler interface that resolves them.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use tablesync_common::{
    record_id, Error, Record, RecordId, Result, TableAction,
};
use tablesync_storage::{LocalStore, StoreOperation};

use crate::operations::{
    version_of, LogRecord, MetadataAction, OperationLog, PendingOperation,
};
use crate::queue::SerialTaskQueue;

/// Result of a handler callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The failure was dealt with; push re-examines the operation.
    Handled,
    /// The failure stands.
    Unhandled,
}

/// Application hook invoked when pushing an operation fails.
///
/// A handler typically calls one of the remediation methods of
/// [`PushError`] and returns [`HandlerOutcome::Handled`]. Returning an error
/// is the same as returning `Unhandled`.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Called for 409 and 412 responses.
    async fn on_conflict(&self, _error: &PushError) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::Unhandled)
    }

    /// Called for every other failure.
    async fn on_error(&self, _error: &PushError) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::Unhandled)
    }
}

/// A failed attempt to push one operation.
pub struct PushError {
    log_record: LogRecord,
    client_record: Option<Record>,
    server_record: Option<Record>,
    http_status: Option<u16>,
    is_conflict: bool,
    error: Error,
    store: Arc<dyn LocalStore>,
    operations: Arc<OperationLog>,
    store_queue: Arc<SerialTaskQueue>,
}

impl fmt::Debug for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("log_record", &self.log_record)
            .field("http_status", &self.http_status)
            .field("is_conflict", &self.is_conflict)
            .field("error", &self.error)
            .finish()
    }
}

impl PushError {
    pub(crate) fn new(
        pending: PendingOperation,
        error: Error,
        store: Arc<dyn LocalStore>,
        operations: Arc<OperationLog>,
        store_queue: Arc<SerialTaskQueue>,
    ) -> Self {
        let (http_status, server_record, is_conflict) = match &error {
            Error::Remote(remote) => (
                remote.http_status,
                remote.server_record.clone(),
                remote.is_conflict(),
            ),
            _ => (None, None, false),
        };

        Self {
            log_record: pending.log_record,
            client_record: pending.data,
            server_record,
            http_status,
            is_conflict,
            error,
            store,
            operations,
            store_queue,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.log_record.table_name
    }

    pub fn action(&self) -> TableAction {
        self.log_record.action
    }

    pub fn item_id(&self) -> &str {
        &self.log_record.item_id
    }

    /// Local copy of the record that was pushed. `None` for deletes.
    pub fn client_record(&self) -> Option<&Record> {
        self.client_record.as_ref()
    }

    /// Server copy of the record returned with the failure.
    pub fn server_record(&self) -> Option<&Record> {
        self.server_record.as_ref()
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Whether the server rejected a stale version (409 or 412).
    pub fn is_conflict(&self) -> bool {
        self.is_conflict
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn log_record(&self) -> &LogRecord {
        &self.log_record
    }

    pub(crate) fn into_error(self) -> Error {
        self.error
    }

    fn log_row_id(&self) -> RecordId {
        RecordId::Int(self.log_record.id)
    }

    fn check_updatable(&self, new_value: &Record) -> Result<()> {
        if self.log_record.action == TableAction::Delete {
            return Err(Error::InvalidInput("Cannot update a deleted record".to_string()));
        }
        if record_id(new_value)? != self.log_record.item_id {
            return Err(Error::InvalidInput(
                "Only updating the record being pushed is allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop the operation, leaving the local record as it is.
    pub async fn cancel(&self) -> Result<()> {
        self.store_queue
            .run(async {
                self.store
                    .execute_batch(vec![StoreOperation::delete(
                        self.operations.table(),
                        self.log_row_id(),
                    )])
                    .await
            })
            .await
    }

    /// Drop the operation and overwrite the local record with `new_value`.
    ///
    /// # Errors
    /// - The operation is a delete
    /// - `new_value` has a different id
    pub async fn cancel_and_update(&self, new_value: Record) -> Result<()> {
        self.store_queue
            .run(async {
                self.check_updatable(&new_value)?;
                self.store
                    .execute_batch(vec![
                        StoreOperation::upsert(self.table_name(), new_value),
                        StoreOperation::delete(self.operations.table(), self.log_row_id()),
                    ])
                    .await
            })
            .await
    }

    /// Drop the operation and delete the local record.
    pub async fn cancel_and_discard(&self) -> Result<()> {
        self.store_queue
            .run(async {
                self.store
                    .execute_batch(vec![
                        StoreOperation::delete(self.table_name(), self.item_id()),
                        StoreOperation::delete(self.operations.table(), self.log_row_id()),
                    ])
                    .await
            })
            .await
    }

    /// Replace the local record with `new_value` and keep the operation,
    /// taking its version for the next attempt.
    ///
    /// # Errors
    /// - The operation is a delete
    /// - `new_value` has a different id
    pub async fn update(&self, new_value: Record) -> Result<()> {
        self.store_queue
            .run(async {
                self.check_updatable(&new_value)?;

                let metadata = self
                    .operations
                    .get_metadata(self.table_name(), MetadataAction::Upsert, &new_value)
                    .await?;
                let log_record = LogRecord {
                    metadata,
                    ..self.log_record.clone()
                };

                self.store
                    .execute_batch(vec![
                        StoreOperation::upsert(self.operations.table(), log_record.to_record()?),
                        StoreOperation::upsert(self.table_name(), new_value),
                    ])
                    .await
            })
            .await
    }

    /// Change the action of the operation.
    ///
    /// When `new_record` is given it replaces the local record and its
    /// version replaces the operation's. Changing to a delete removes the
    /// local record.
    ///
    /// # Errors
    /// - `new_record` has a different id
    /// - Changing a delete into an insert or update without `new_record`
    pub async fn change_action(
        &self,
        new_action: TableAction,
        new_record: Option<Record>,
    ) -> Result<()> {
        self.store_queue
            .run(async {
                let mut log_record = self.log_record.clone();

                if let Some(record) = &new_record {
                    let id = record_id(record)?;
                    if id != self.log_record.item_id {
                        return Err(Error::InvalidInput(format!(
                            "New client record value cannot change the record ID. Original ID: {} New ID: {}",
                            self.log_record.item_id, id
                        )));
                    }
                    log_record.metadata.version = version_of(record)?;
                }

                let old_action = log_record.action;
                log_record.action = new_action;

                let data_operation = match (new_action, new_record) {
                    (TableAction::Delete, _) => {
                        Some(StoreOperation::delete(self.table_name(), self.item_id()))
                    }
                    (_, Some(record)) => Some(StoreOperation::upsert(self.table_name(), record)),
                    (_, None) if old_action == TableAction::Delete => {
                        return Err(Error::InvalidInput(format!(
                            "Changing action from {} to {} without specifying a value for the associated record is not allowed",
                            old_action, new_action
                        )));
                    }
                    (_, None) => None,
                };

                let mut batch = vec![StoreOperation::upsert(
                    self.operations.table(),
                    log_record.to_record()?,
                )];
                batch.extend(data_operation);

                self.store.execute_batch(batch).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tablesync_common::{Query, RemoteError};
    use tablesync_storage::{ColumnType, MemoryStore, TableDefinition};

    const OPS: &str = "__operations";

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        operations: Arc<OperationLog>,
        queue: Arc<SerialTaskQueue>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            store
                .define_table(&TableDefinition::new("todo").column("id", ColumnType::Text))
                .await
                .unwrap();
            let operations = Arc::new(OperationLog::new(store.clone(), OPS));
            operations.initialize().await.unwrap();
            Self {
                store,
                operations,
                queue: Arc::new(SerialTaskQueue::new("store")),
            }
        }

        // Record a local mutation and build the error its push would produce.
        async fn failed(&self, action: TableAction, item: Value, status: u16) -> PushError {
            let item = record(item);
            let mut batch = Vec::new();
            match action {
                TableAction::Delete => {}
                _ => batch.push(StoreOperation::upsert("todo", item.clone())),
            }
            if let Some(op) = self
                .operations
                .get_logging_operation("todo", action, &item)
                .await
                .unwrap()
            {
                batch.push(op);
            }
            self.store.execute_batch(batch).await.unwrap();

            let pending = self
                .operations
                .read_first_pending_operation_with_data(-1)
                .await
                .unwrap()
                .unwrap();
            let error = Error::Remote(
                RemoteError::with_status(status, "failed")
                    .with_server_record(record(json!({"id": "a", "version": "server"}))),
            );
            PushError::new(
                pending,
                error,
                self.store.clone(),
                self.operations.clone(),
                self.queue.clone(),
            )
        }

        async fn log_rows(&self) -> Vec<LogRecord> {
            self.operations.read_table_operations("todo").await.unwrap()
        }

        async fn data(&self, id: &str) -> Option<Record> {
            self.store.lookup("todo", &RecordId::from(id), true).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_accessors() {
        let fixture = Fixture::new().await;
        let error = fixture
            .failed(TableAction::Insert, json!({"id": "a", "text": "x"}), 412)
            .await;

        assert_eq!(error.table_name(), "todo");
        assert_eq!(error.action(), TableAction::Insert);
        assert_eq!(error.item_id(), "a");
        assert_eq!(error.http_status(), Some(412));
        assert!(error.is_conflict());
        assert_eq!(error.client_record().unwrap()["text"], json!("x"));
        assert_eq!(error.server_record().unwrap()["version"], json!("server"));
        assert!(matches!(error.error(), Error::Remote(_)));
    }

    #[tokio::test]
    async fn test_non_remote_error_is_not_conflict() {
        let fixture = Fixture::new().await;
        let mut error = fixture.failed(TableAction::Insert, json!({"id": "a"}), 409).await;
        assert!(error.is_conflict());

        let pending = PendingOperation {
            log_record: error.log_record().clone(),
            data: None,
        };
        error = PushError::new(
            pending,
            Error::Storage("disk".to_string()),
            fixture.store.clone(),
            fixture.operations.clone(),
            fixture.queue.clone(),
        );
        assert!(!error.is_conflict());
        assert_eq!(error.http_status(), None);
    }

    #[tokio::test]
    async fn test_cancel() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Insert, json!({"id": "a"}), 409).await;

        error.cancel().await.unwrap();
        assert!(fixture.log_rows().await.is_empty());
        assert!(fixture.data("a").await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_and_update() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Update, json!({"id": "a", "n": 1}), 412).await;

        let wrong_id = record(json!({"id": "b"}));
        assert!(error.cancel_and_update(wrong_id).await.is_err());
        assert_eq!(fixture.log_rows().await.len(), 1);

        error
            .cancel_and_update(record(json!({"id": "a", "n": 2})))
            .await
            .unwrap();
        assert!(fixture.log_rows().await.is_empty());
        assert_eq!(fixture.data("a").await.unwrap()["n"], json!(2));
    }

    #[tokio::test]
    async fn test_update_rejected_for_delete() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Delete, json!({"id": "a"}), 412).await;

        assert!(error.update(record(json!({"id": "a"}))).await.is_err());
        assert!(error.cancel_and_update(record(json!({"id": "a"}))).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_discard() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Insert, json!({"id": "a"}), 409).await;

        error.cancel_and_discard().await.unwrap();
        assert!(fixture.log_rows().await.is_empty());
        assert!(fixture.data("a").await.is_none());
    }

    #[tokio::test]
    async fn test_update_takes_new_version() {
        let fixture = Fixture::new().await;
        let error = fixture
            .failed(TableAction::Update, json!({"id": "a", "version": "old"}), 412)
            .await;

        error
            .update(record(json!({"id": "a", "version": "server", "n": 5})))
            .await
            .unwrap();

        let rows = fixture.log_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, TableAction::Update);
        assert_eq!(rows[0].metadata.version.as_deref(), Some("server"));
        assert_eq!(fixture.data("a").await.unwrap()["n"], json!(5));
    }

    #[tokio::test]
    async fn test_change_action_to_update() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Insert, json!({"id": "a"}), 409).await;

        error
            .change_action(
                TableAction::Update,
                Some(record(json!({"id": "a", "version": "server", "n": 1}))),
            )
            .await
            .unwrap();

        let rows = fixture.log_rows().await;
        assert_eq!(rows[0].action, TableAction::Update);
        assert_eq!(rows[0].metadata.version.as_deref(), Some("server"));
        assert_eq!(fixture.data("a").await.unwrap()["n"], json!(1));
    }

    #[tokio::test]
    async fn test_change_action_to_delete_removes_data() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Update, json!({"id": "a"}), 412).await;

        error.change_action(TableAction::Delete, None).await.unwrap();

        let rows = fixture.log_rows().await;
        assert_eq!(rows[0].action, TableAction::Delete);
        assert!(fixture.data("a").await.is_none());
    }

    #[tokio::test]
    async fn test_change_action_from_delete_needs_record() {
        let fixture = Fixture::new().await;
        let error = fixture.failed(TableAction::Delete, json!({"id": "a"}), 412).await;

        assert!(error.change_action(TableAction::Insert, None).await.is_err());
        assert!(error
            .change_action(TableAction::Insert, Some(record(json!({"id": "other"}))))
            .await
            .is_err());

        error
            .change_action(TableAction::Insert, Some(record(json!({"id": "a"}))))
            .await
            .unwrap();
        let rows = fixture.log_rows().await;
        assert_eq!(rows[0].action, TableAction::Insert);
        assert!(fixture.data("a").await.is_some());

        let all = fixture.store.read(&Query::new(OPS)).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
