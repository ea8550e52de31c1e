//! Operation log: the persisted queue of local mutations awaiting push.
//!
//! Every local insert, update or delete is recorded as a row in the
//! operation-log table. A new mutation of a record that already has a pending
//! row is condensed into it, so that at most one row is pending per record
//! (see [`condense_action`]). The push engine locks the row it is sending;
//! a locked row is never condensed into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use tablesync_common::{
    record_id, system_columns, Comparison, Error, Query, Record, RecordId, Result, TableAction,
};
use tablesync_storage::{DeleteTarget, LocalStore, StoreOperation};

use crate::queue::SerialTaskQueue;
use crate::schema::{self, operation_columns};

/// Metadata stored with a log row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Concurrency token sent with the remote request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A row of the operation-log table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub table_name: String,
    pub action: TableAction,
    pub item_id: String,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl LogRecord {
    /// Convert into a store record.
    pub fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(record) => Ok(record),
            _ => Err(Error::Serialization(
                "log record did not serialize to an object".to_string(),
            )),
        }
    }

    /// Parse a store record.
    pub fn from_record(record: Record) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(record))?)
    }
}

/// Oldest pending row together with the record it refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub log_record: LogRecord,
    /// Current local copy of the record. Always `None` for deletes.
    pub data: Option<Record>,
}

/// How a new mutation is merged into the pending row of the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseAction {
    /// Append a new row.
    Add,
    /// Change the pending row's action to the new one.
    Modify,
    /// Drop the pending row.
    Remove,
    /// Nothing to log.
    Nop,
}

/// Action whose metadata is being computed.
///
/// `Upsert` is used when a push error handler rewrites a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataAction {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl From<TableAction> for MetadataAction {
    fn from(action: TableAction) -> Self {
        match action {
            TableAction::Insert => MetadataAction::Insert,
            TableAction::Update => MetadataAction::Update,
            TableAction::Delete => MetadataAction::Delete,
        }
    }
}

/// Decide how `new` is condensed into a pending row with action `pending`.
///
/// | pending | new | result |
/// |---|---|---|
/// | insert | update | nop |
/// | insert | delete | remove |
/// | update | update | nop |
/// | update | delete | modify |
/// | delete | delete | nop |
///
/// Anything else is an error. A locked pending row always yields `Add`, but
/// only after the unsupported pairs have been rejected.
pub fn condense_action(
    pending: TableAction,
    new: TableAction,
    pending_locked: bool,
) -> Result<CondenseAction> {
    use TableAction::*;

    let action = match (pending, new) {
        (Insert, Update) => CondenseAction::Nop,
        (Insert, Delete) => CondenseAction::Remove,
        (Update, Update) => CondenseAction::Nop,
        (Update, Delete) => CondenseAction::Modify,
        (Delete, Delete) => CondenseAction::Nop,
        (Delete, _) => {
            return Err(Error::Condense(format!(
                "Operation {} not supported as a DELETE operation is pending",
                new
            )))
        }
        _ => {
            return Err(Error::Condense(format!(
                "Condense not supported when pending action is {} and new action is {}",
                pending, new
            )))
        }
    };

    if pending_locked {
        return Ok(CondenseAction::Add);
    }
    Ok(action)
}

/// The `version` token of a record.
///
/// Numeric versions are kept as their decimal text, the form they take in a
/// request header. `null` and a missing property both mean no version.
///
/// # Errors
/// - A version that is neither a string nor a number
pub(crate) fn version_of(record: &Record) -> Result<Option<String>> {
    match record.get(system_columns::VERSION) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(version)) => Ok(Some(version.clone())),
        Some(Value::Number(version)) => Ok(Some(version.to_string())),
        Some(other) => Err(Error::InvalidInput(format!(
            "version {} is not a valid concurrency token",
            other
        ))),
    }
}

/// Manages the operation-log table of a local store.
pub struct OperationLog {
    store: Arc<dyn LocalStore>,
    table: String,
    queue: SerialTaskQueue,
    initialized: AtomicBool,
    max_id: AtomicI64,
    locked: Mutex<Option<i64>>,
}

impl OperationLog {
    /// Create a log kept in `table` of `store`.
    pub fn new(store: Arc<dyn LocalStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            queue: SerialTaskQueue::new("operation-log"),
            initialized: AtomicBool::new(false),
            max_id: AtomicI64::new(0),
            locked: Mutex::new(None),
        }
    }

    /// Name of the operation-log table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Define the log table and load the highest existing row id.
    pub async fn initialize(&self) -> Result<()> {
        self.store
            .define_table(&schema::operation_table(&self.table))
            .await?;

        let query = Query::new(&self.table)
            .order_by_descending(operation_columns::ID)
            .take(1);
        let max_id = match self.store.read(&query).await?.into_iter().next() {
            Some(row) => LogRecord::from_record(row)?.id,
            None => 0,
        };

        self.max_id.store(max_id, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        debug!("Operation log initialized, max id {}", max_id);
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized(
                "Operation table manager is not initialized".to_string(),
            ))
        }
    }

    /// Lock the row with the given id.
    ///
    /// Locking the already-locked row is a no-op.
    ///
    /// # Errors
    /// - A different row is locked
    pub async fn lock_operation(&self, id: i64) -> Result<()> {
        self.queue
            .run(async {
                let mut locked = self.locked.lock().await;
                let current = *locked;
                match current {
                    Some(current) if current == id => Ok(()),
                    None => {
                        *locked = Some(id);
                        Ok(())
                    }
                    Some(current) => Err(Error::Lock(format!(
                        "Only one operation can be locked at a time; operation {} is locked",
                        current
                    ))),
                }
            })
            .await
    }

    /// Clear the lock.
    pub async fn unlock_operation(&self) {
        self.queue
            .run(async {
                *self.locked.lock().await = None;
            })
            .await
    }

    /// Whether the row with the given id is locked.
    pub async fn is_locked(&self, id: i64) -> bool {
        *self.locked.lock().await == Some(id)
    }

    /// Id of the locked row, if any.
    pub async fn locked_operation_id(&self) -> Option<i64> {
        *self.locked.lock().await
    }

    /// Compute the store operation that records `action` on `item`.
    ///
    /// Returns `None` when nothing needs to be logged.
    ///
    /// # Errors
    /// - Empty table name or an item without a valid id
    /// - Log not initialized
    /// - The action cannot be condensed into the pending row
    pub async fn get_logging_operation(
        &self,
        table: &str,
        action: TableAction,
        item: &Record,
    ) -> Result<Option<StoreOperation>> {
        if table.is_empty() {
            return Err(Error::InvalidInput("table name cannot be empty".to_string()));
        }
        let item_id = record_id(item)?;

        self.queue
            .run(async {
                self.ensure_initialized()?;

                let pending = self.read_pending_operations(table, &item_id).await?.pop();
                let condense = match &pending {
                    Some(row) => {
                        let locked = self.is_locked(row.id).await;
                        condense_action(row.action, action, locked)?
                    }
                    None => CondenseAction::Add,
                };
                debug!(
                    "Logging {} of {}/{}: {:?}",
                    action, table, item_id, condense
                );

                match (condense, pending) {
                    (CondenseAction::Nop, _) => Ok::<_, Error>(None),
                    (CondenseAction::Remove, Some(row)) => Ok(Some(StoreOperation::delete(
                        self.table.as_str(),
                        RecordId::Int(row.id),
                    ))),
                    (CondenseAction::Modify, Some(row)) => {
                        let metadata = self.get_metadata(table, action.into(), item).await?;
                        let log_record = LogRecord {
                            action,
                            metadata,
                            ..row
                        };
                        Ok(Some(StoreOperation::upsert(
                            self.table.as_str(),
                            log_record.to_record()?,
                        )))
                    }
                    _ => {
                        let metadata = self.get_metadata(table, action.into(), item).await?;
                        let log_record = LogRecord {
                            id: self.max_id.fetch_add(1, Ordering::SeqCst) + 1,
                            table_name: table.to_string(),
                            action,
                            item_id: item_id.clone(),
                            metadata,
                        };
                        Ok(Some(StoreOperation::upsert(
                            self.table.as_str(),
                            log_record.to_record()?,
                        )))
                    }
                }
            })
            .await
    }

    /// All pending rows of a record, oldest first.
    pub async fn read_pending_operations(
        &self,
        table: &str,
        item_id: &str,
    ) -> Result<Vec<LogRecord>> {
        self.ensure_initialized()?;

        let query = Query::new(&self.table)
            .where_eq(operation_columns::TABLE_NAME, table)
            .where_eq(operation_columns::ITEM_ID, item_id)
            .order_by(operation_columns::ID);

        self.store
            .read(&query)
            .await?
            .into_iter()
            .map(LogRecord::from_record)
            .collect()
    }

    /// All pending rows of a table, oldest first.
    pub async fn read_table_operations(&self, table: &str) -> Result<Vec<LogRecord>> {
        self.ensure_initialized()?;

        let query = Query::new(&self.table)
            .where_eq(operation_columns::TABLE_NAME, table)
            .order_by(operation_columns::ID);

        self.store
            .read(&query)
            .await?
            .into_iter()
            .map(LogRecord::from_record)
            .collect()
    }

    /// Oldest row with an id greater than `last_processed_id`, with its data.
    ///
    /// Insert and update rows whose record no longer exists locally are
    /// removed and skipped.
    pub async fn read_first_pending_operation_with_data(
        &self,
        last_processed_id: i64,
    ) -> Result<Option<PendingOperation>> {
        self.queue
            .run(async {
                self.ensure_initialized()?;
                let mut last_processed_id = last_processed_id;

                loop {
                    let query = Query::new(&self.table)
                        .filter(operation_columns::ID, Comparison::Gt, last_processed_id)
                        .order_by(operation_columns::ID)
                        .take(1);

                    let row = match self.store.read(&query).await?.into_iter().next() {
                        Some(row) => row,
                        None => return Ok::<_, Error>(None),
                    };
                    let log_record = LogRecord::from_record(row)?;

                    if log_record.action == TableAction::Delete {
                        return Ok(Some(PendingOperation {
                            log_record,
                            data: None,
                        }));
                    }

                    let data = self
                        .store
                        .lookup(
                            &log_record.table_name,
                            &RecordId::from(log_record.item_id.as_str()),
                            true,
                        )
                        .await?;

                    if let Some(data) = data {
                        return Ok(Some(PendingOperation {
                            log_record,
                            data: Some(data),
                        }));
                    }

                    debug!(
                        "Removing orphaned {} operation {} for {}/{}",
                        log_record.action,
                        log_record.id,
                        log_record.table_name,
                        log_record.item_id
                    );
                    self.store
                        .del(
                            &self.table,
                            DeleteTarget::Ids(vec![RecordId::Int(log_record.id)]),
                        )
                        .await?;
                    last_processed_id = log_record.id;
                }
            })
            .await
    }

    /// Delete the locked row and clear the lock.
    ///
    /// # Errors
    /// - No row is locked
    pub async fn remove_locked_operation(&self) -> Result<()> {
        self.queue
            .run(async {
                let mut locked = self.locked.lock().await;
                let id = (*locked)
                    .ok_or_else(|| Error::Lock("No operation is locked".to_string()))?;

                self.store
                    .del(&self.table, DeleteTarget::Ids(vec![RecordId::Int(id)]))
                    .await?;
                *locked = None;
                Ok::<_, Error>(())
            })
            .await
    }

    /// Compute the metadata to store with a log row for `item`.
    ///
    /// Inserts and upserts, and updates whose item carries a `version`
    /// property, take the item's own version. Other updates and deletes use
    /// the version of the stored record, if there is one.
    pub async fn get_metadata(
        &self,
        table: &str,
        action: MetadataAction,
        item: &Record,
    ) -> Result<OperationMetadata> {
        match action {
            MetadataAction::Upsert | MetadataAction::Insert => Ok(OperationMetadata {
                version: version_of(item)?,
            }),
            MetadataAction::Update if item.contains_key(system_columns::VERSION) => {
                Ok(OperationMetadata {
                    version: version_of(item)?,
                })
            }
            MetadataAction::Update | MetadataAction::Delete => {
                let id = RecordId::from(record_id(item)?);
                let version = match self.store.lookup(table, &id, true).await? {
                    Some(stored) => version_of(&stored)?,
                    None => None,
                };
                Ok(OperationMetadata { version })
            }
        }
    }
}
