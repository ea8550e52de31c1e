//! Pull: page remote records into the local store.
//!
//! Records are requested in ascending `updatedAt` order, starting from a
//! watermark. After each page the watermark moves to the `updatedAt` of the
//! page's last record. When a whole page shares the watermark timestamp the
//! next page is requested with a growing `skip` instead, so that runs of
//! records with identical timestamps longer than a page are not fetched
//! forever. A pull ends on the first empty page.
//!
//! With a query id the watermark is persisted after every page, and the next
//! pull with the same id resumes from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use tablesync_common::{
    format_timestamp, parse_timestamp, record_id, system_columns, Comparison, Error, Query,
    Record, RecordId, Result,
};
use tablesync_storage::{DeleteTarget, LocalStore};

use crate::config::SyncConfig;
use crate::operations::OperationLog;
use crate::queue::SerialTaskQueue;
use crate::remote::{Feature, RemoteTableClient, RequestOptions};
use crate::schema::{self, pulltime_columns};

/// Per-call pull settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSettings {
    /// Records per page; the configured default when `None`.
    pub page_size: Option<usize>,
}

impl PullSettings {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
        }
    }
}

/// Outcome of a pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullStats {
    /// Pages fetched, including the final empty one.
    pub pages: usize,
    /// Records written to or deleted from the local store.
    pub applied: usize,
    /// Records left alone because they have pending operations.
    pub skipped: usize,
}

// 1970-01-01T00:00:00Z
fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn validate_query(query: &Query) -> Result<()> {
    if !query.ordering.is_empty() {
        return Err(Error::UnsupportedQuery(
            "orderBy and orderByDescending clauses are not supported in the pull query".to_string(),
        ));
    }
    if query.skip.is_some() {
        return Err(Error::UnsupportedQuery(
            "skip is not supported in the pull query".to_string(),
        ));
    }
    if query.take.is_some() {
        return Err(Error::UnsupportedQuery(
            "take is not supported in the pull query".to_string(),
        ));
    }
    if !query.selections.is_empty() {
        return Err(Error::UnsupportedQuery(
            "select is not supported in the pull query".to_string(),
        ));
    }
    if query.include_total_count {
        return Err(Error::UnsupportedQuery(
            "includeTotalCount is not supported in the pull query".to_string(),
        ));
    }
    Ok(())
}

/// Pulls remote records into the local store.
pub struct PullEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteTableClient>,
    operations: Arc<OperationLog>,
    store_queue: Arc<SerialTaskQueue>,
    queue: SerialTaskQueue,
    pulltime_table: String,
    default_page_size: usize,
}

impl PullEngine {
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
            queue: SerialTaskQueue::new("pull"),
            pulltime_table: config.pulltime_table.clone(),
            default_page_size: config.default_page_size,
        }
    }

    /// Define the watermark table.
    pub async fn initialize(&self) -> Result<()> {
        self.queue
            .run(
                self.store
                    .define_table(&schema::pulltime_table(&self.pulltime_table)),
            )
            .await
    }

    /// Pull the records matching `query` into the local store.
    ///
    /// # Preconditions
    /// - `query` has no ordering, skip, take, selection or total count
    /// - `query_id`, when given, is not empty
    ///
    /// # Errors
    /// - Invalid query, query id or page size, before any request is made
    /// - A pulled record without a valid id or `deleted` flag
    /// - A non-empty page whose last record has no valid `updatedAt`
    /// - Remote and local store failures
    pub async fn pull(
        &self,
        query: &Query,
        query_id: Option<&str>,
        settings: &PullSettings,
    ) -> Result<PullStats> {
        self.queue
            .run(self.pull_all(query, query_id, settings))
            .await
    }

    async fn pull_all(
        &self,
        query: &Query,
        query_id: Option<&str>,
        settings: &PullSettings,
    ) -> Result<PullStats> {
        validate_query(query)?;
        if query_id == Some("") {
            return Err(Error::InvalidInput("query id cannot be empty".to_string()));
        }
        let page_size = settings.page_size.unwrap_or(self.default_page_size);
        if page_size == 0 {
            return Err(Error::InvalidInput(format!(
                "Page size must be a positive integer. Page size {} is invalid.",
                page_size
            )));
        }

        let table = query.table.as_str();
        let mut options = match query_id {
            Some(_) => RequestOptions::with_features([Feature::OfflineSync, Feature::IncrementalPull]),
            None => RequestOptions::with_features([Feature::OfflineSync]),
        };
        options = options.include_deleted();

        let mut watermark = match query_id {
            Some(id) => self.read_watermark(id).await?.unwrap_or_else(epoch),
            None => epoch(),
        };
        let mut skip = 0usize;
        let mut stats = PullStats::default();

        info!(
            "Starting pull of {} from {}",
            table,
            format_timestamp(&watermark)
        );

        loop {
            let mut page_query = query
                .clone()
                .filter(system_columns::UPDATED_AT, Comparison::Ge, watermark)
                .order_by(system_columns::UPDATED_AT)
                .take(page_size);
            if skip > 0 {
                page_query = page_query.skip(skip);
            }

            let records = self.remote.read(&page_query, &options).await?;
            stats.pages += 1;

            let last_updated_at = match records.last() {
                Some(last) => last.get(system_columns::UPDATED_AT).cloned(),
                None => break,
            };

            for record in &records {
                if self.apply_record(table, record).await? {
                    stats.applied += 1;
                } else {
                    stats.skipped += 1;
                }
            }

            let last_updated_at = last_updated_at
                .as_ref()
                .and_then(parse_timestamp)
                .ok_or_else(|| {
                    Error::Pull(format!(
                        "Property {} of the last record should be a valid date",
                        system_columns::UPDATED_AT
                    ))
                })?;

            if let Some(id) = query_id {
                self.write_watermark(id, table, &last_updated_at).await?;
            }

            if last_updated_at == watermark {
                skip += records.len();
            } else {
                watermark = last_updated_at;
                skip = 0;
            }
            debug!(
                "Pulled page of {} records from {}, next watermark {} skip {}",
                records.len(),
                table,
                format_timestamp(&watermark),
                skip
            );
        }

        info!(
            "Pull of {} complete: {} pages, {} applied, {} skipped",
            table, stats.pages, stats.applied, stats.skipped
        );
        Ok(stats)
    }

    /// Write one pulled record locally. Returns false when it was skipped.
    async fn apply_record(&self, table: &str, record: &Record) -> Result<bool> {
        self.store_queue
            .run(async {
                let id = record_id(record).map_err(|_| {
                    Error::Pull("Pulled record does not have a valid ID".to_string())
                })?;

                let pending = self.operations.read_pending_operations(table, &id).await?;
                if !pending.is_empty() {
                    debug!("Skipping pulled record {}/{} with pending operations", table, id);
                    return Ok(false);
                }

                match record.get(system_columns::DELETED) {
                    Some(Value::Bool(true)) => {
                        self.store
                            .del(table, DeleteTarget::Ids(vec![RecordId::from(id)]))
                            .await?;
                    }
                    Some(Value::Bool(false)) => {
                        self.store.upsert(table, record.clone()).await?;
                    }
                    _ => {
                        return Err(Error::Pull(format!(
                            "'{}' system property is missing. Pull cannot work without it.",
                            system_columns::DELETED
                        )));
                    }
                }
                Ok::<_, Error>(true)
            })
            .await
    }

    async fn read_watermark(&self, query_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .store_queue
            .run(
                self.store
                    .lookup(&self.pulltime_table, &RecordId::from(query_id), true),
            )
            .await?;

        match row {
            Some(row) => {
                let value = row.get(pulltime_columns::VALUE).unwrap_or(&Value::Null);
                parse_timestamp(value).map(Some).ok_or_else(|| {
                    Error::Pull(format!("Stored watermark of {} is not a valid date", query_id))
                })
            }
            None => Ok(None),
        }
    }

    async fn write_watermark(
        &self,
        query_id: &str,
        table: &str,
        value: &DateTime<Utc>,
    ) -> Result<()> {
        let mut row = Record::new();
        row.insert(pulltime_columns::ID.to_string(), Value::from(query_id));
        row.insert(pulltime_columns::TABLE_NAME.to_string(), Value::from(table));
        row.insert(pulltime_columns::VALUE.to_string(), Value::from(format_timestamp(value)));

        self.store_queue
            .run(self.store.upsert(&self.pulltime_table, row))
            .await?;
        Ok(())
    }
}
