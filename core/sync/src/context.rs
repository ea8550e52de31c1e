//! The sync context: the public face of the offline store.
//!
//! Local writes are recorded in the operation log together with the data
//! change, as one batch. Writes to the local store are serialized through a
//! single store queue shared with the engines; pull, push and purge are
//! serialized against each other through a separate sync queue.

use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use tablesync_common::{
    record_id, system_columns, validate_id, Error, Query, Record, RecordId, Result, TableAction,
};
use tablesync_storage::{LocalStore, StoreOperation};

use crate::config::SyncConfig;
use crate::operations::OperationLog;
use crate::pull::{PullEngine, PullSettings, PullStats};
use crate::purge::PurgeEngine;
use crate::push::PushEngine;
use crate::push_error::{PushError, PushHandler};
use crate::queue::SerialTaskQueue;
use crate::remote::RemoteTableClient;

struct Engines {
    store: Arc<dyn LocalStore>,
    operations: Arc<OperationLog>,
    pull: PullEngine,
    push: PushEngine,
    purge: PurgeEngine,
}

/// Local CRUD with change tracking, plus pull, push and purge.
pub struct SyncContext {
    remote: Arc<dyn RemoteTableClient>,
    config: SyncConfig,
    store_queue: Arc<SerialTaskQueue>,
    sync_queue: SerialTaskQueue,
    engines: OnceCell<Engines>,
    push_handler: RwLock<Option<Arc<dyn PushHandler>>>,
}

impl SyncContext {
    /// Create a context talking to `remote`.
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(remote: Arc<dyn RemoteTableClient>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            remote,
            config,
            store_queue: Arc::new(SerialTaskQueue::new("store")),
            sync_queue: SerialTaskQueue::new("sync"),
            engines: OnceCell::new(),
            push_handler: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.engines.initialized()
    }

    /// Attach the context to a local store.
    ///
    /// Defines the operation-log and watermark tables. Once this has
    /// succeeded, further calls do nothing; a failed call may be retried.
    ///
    /// # Errors
    /// - Local store failures
    pub async fn initialize(&self, store: Arc<dyn LocalStore>) -> Result<()> {
        let config = &self.config;
        let remote = self.remote.clone();
        let store_queue = self.store_queue.clone();

        self.engines
            .get_or_try_init(|| async move {
                let operations = Arc::new(OperationLog::new(
                    store.clone(),
                    config.operation_table.clone(),
                ));
                operations.initialize().await?;

                let pull = PullEngine::new(
                    store.clone(),
                    remote.clone(),
                    operations.clone(),
                    store_queue.clone(),
                    config,
                );
                pull.initialize().await?;

                let push = PushEngine::new(
                    store.clone(),
                    remote,
                    operations.clone(),
                    store_queue.clone(),
                    config,
                );
                let purge = PurgeEngine::new(store.clone(), store_queue, config);

                info!("Sync context initialized on store {}", store.name());
                Ok::<_, Error>(Engines {
                    store,
                    operations,
                    pull,
                    push,
                    purge,
                })
            })
            .await?;
        Ok(())
    }

    fn engines(&self) -> Result<&Engines> {
        self.engines.get().ok_or_else(|| {
            Error::NotInitialized("sync context is used before it is initialized".to_string())
        })
    }

    /// Set the handler consulted by [`push`](Self::push).
    pub async fn set_push_handler(&self, handler: Option<Arc<dyn PushHandler>>) {
        *self.push_handler.write().await = handler;
    }

    /// Insert a record and log the insert.
    ///
    /// A record without an id is given a fresh UUID.
    ///
    /// # Returns
    /// The inserted record, including its id.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if a record with the same id is stored
    /// - Invalid id
    /// - The insert cannot be condensed into a pending operation
    pub async fn insert(&self, table: &str, mut record: Record) -> Result<Record> {
        let engines = self.engines()?;
        ensure_table(table)?;

        let missing_id = record
            .get(system_columns::ID)
            .map_or(true, serde_json::Value::is_null);
        if missing_id {
            record.insert(
                system_columns::ID.to_string(),
                serde_json::Value::String(Uuid::new_v4().to_string()),
            );
        }
        let id = row_id(&record)?;

        self.store_queue
            .run(async {
                if engines.store.lookup(table, &id, true).await?.is_some() {
                    return Err(Error::AlreadyExists(format!(
                        "Record with id {} already exists in the table {}",
                        id, table
                    )));
                }
                self.upsert_with_logging(engines, table, record, TableAction::Insert)
                    .await
            })
            .await
    }

    /// Overwrite a record and log the update.
    ///
    /// # Errors
    /// - Invalid id
    /// - The update cannot be condensed into a pending operation
    pub async fn update(&self, table: &str, record: Record) -> Result<Record> {
        let engines = self.engines()?;
        ensure_table(table)?;
        row_id(&record)?;

        self.store_queue
            .run(self.upsert_with_logging(engines, table, record, TableAction::Update))
            .await
    }

    /// Look up a record by id.
    ///
    /// # Errors
    /// - `Error::NotFound` if there is no such record and `suppress_not_found`
    ///   is false
    pub async fn lookup(
        &self,
        table: &str,
        id: &str,
        suppress_not_found: bool,
    ) -> Result<Option<Record>> {
        let engines = self.engines()?;
        ensure_table(table)?;
        validate_id(id)?;

        engines
            .store
            .lookup(table, &RecordId::from(id), suppress_not_found)
            .await
    }

    /// Read the records matching `query`.
    pub async fn read(&self, query: &Query) -> Result<Vec<Record>> {
        let engines = self.engines()?;
        engines.store.read(query).await
    }

    /// Delete a record and log the delete.
    ///
    /// # Errors
    /// - Invalid id
    /// - The delete cannot be condensed into a pending operation
    pub async fn del(&self, table: &str, record: &Record) -> Result<()> {
        let engines = self.engines()?;
        ensure_table(table)?;
        let id = row_id(record)?;

        self.store_queue
            .run(async {
                let mut batch = vec![StoreOperation::delete(table, id.clone())];
                if let Some(op) = engines
                    .operations
                    .get_logging_operation(table, TableAction::Delete, record)
                    .await?
                {
                    batch.push(op);
                }
                engines.store.execute_batch(batch).await?;
                debug!("Deleted {}/{}", table, id);
                Ok::<_, Error>(())
            })
            .await
    }

    /// Pull records matching `query` from the server.
    ///
    /// See [`PullEngine::pull`].
    pub async fn pull(
        &self,
        query: &Query,
        query_id: Option<&str>,
        settings: &PullSettings,
    ) -> Result<PullStats> {
        let engines = self.engines()?;
        self.sync_queue
            .run(engines.pull.pull(query, query_id, settings))
            .await
    }

    /// Push all pending operations, consulting the push handler on failures.
    ///
    /// See [`PushEngine::push`].
    pub async fn push(&self) -> Result<Vec<PushError>> {
        let engines = self.engines()?;
        let handler = self.push_handler.read().await.clone();
        self.sync_queue
            .run(engines.push.push(handler.as_deref()))
            .await
    }

    /// Purge local records of a table.
    ///
    /// See [`PurgeEngine::purge`].
    pub async fn purge(&self, query: &Query, force: bool) -> Result<()> {
        let engines = self.engines()?;
        self.sync_queue.run(engines.purge.purge(query, force)).await
    }

    async fn upsert_with_logging(
        &self,
        engines: &Engines,
        table: &str,
        record: Record,
        action: TableAction,
    ) -> Result<Record> {
        let mut batch = Vec::with_capacity(2);
        let log_op = engines
            .operations
            .get_logging_operation(table, action, &record)
            .await?;
        batch.push(StoreOperation::upsert(table, record.clone()));
        batch.extend(log_op);
        engines.store.execute_batch(batch).await?;
        Ok(record)
    }
}

fn ensure_table(table: &str) -> Result<()> {
    if table.is_empty() {
        Err(Error::InvalidInput("table name cannot be empty".to_string()))
    } else {
        Ok(())
    }
}

fn row_id(record: &Record) -> Result<RecordId> {
    record_id(record)?;
    record
        .get(system_columns::ID)
        .and_then(RecordId::from_value)
        .ok_or_else(|| Error::InvalidInput("record has no valid id".to_string()))
}
