//! Scripted remote table service for engine tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

use tablesync_common::{
    record_id, system_columns, Error, Query, Record, RemoteError, Result,
};
use tablesync_storage::{ColumnType, TableDefinition};

use crate::remote::{RemoteTableClient, RequestOptions};

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

pub fn todo_table() -> TableDefinition {
    TableDefinition::new("todo")
        .column("id", ColumnType::Text)
        .column("text", ColumnType::Text)
}

/// A request received by [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Read { query: Query, options: RequestOptions },
    Insert { table: String, record: Record, options: RequestOptions },
    Update { table: String, record: Record, options: RequestOptions },
    Delete { table: String, id: String, version: Option<String>, options: RequestOptions },
}

impl RemoteCall {
    pub fn item_id(&self) -> Option<String> {
        match self {
            RemoteCall::Read { .. } => None,
            RemoteCall::Insert { record, .. } | RemoteCall::Update { record, .. } => {
                record.get("id").and_then(Value::as_str).map(str::to_string)
            }
            RemoteCall::Delete { id, .. } => Some(id.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, BTreeMap<String, Record>>,
    failures: HashMap<String, VecDeque<u16>>,
    pages: VecDeque<Vec<Record>>,
    calls: Vec<RemoteCall>,
    next_version: u64,
}

impl State {
    fn take_failure(&mut self, id: &str) -> Option<RemoteError> {
        let status = self.failures.get_mut(id)?.pop_front()?;
        let server_record = self
            .tables
            .values()
            .find_map(|rows| rows.get(id))
            .cloned()
            .unwrap_or_else(|| record(json!({"id": id})));
        Some(RemoteError::with_status(status, format!("scripted {}", status)).with_server_record(server_record))
    }

    fn stamp(&mut self, mut record: Record) -> Record {
        self.next_version += 1;
        record.insert(system_columns::VERSION.to_string(), json!(format!("v{}", self.next_version)));
        record.insert(system_columns::UPDATED_AT.to_string(), json!("2024-01-01T00:00:00.000Z"));
        record.insert(system_columns::DELETED.to_string(), json!(false));
        record
    }
}

/// In-memory remote with scripted failures and pages.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<State>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next writes of `id` with the given statuses, in order.
    pub async fn fail(&self, id: &str, statuses: &[u16]) {
        let mut state = self.state.lock().await;
        state
            .failures
            .entry(id.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Queue a page returned by the next read. Reads return an empty page
    /// once the script is exhausted.
    pub async fn page(&self, records: Vec<Record>) {
        self.state.lock().await.pages.push_back(records);
    }

    /// Store a record on the server without recording a call.
    pub async fn seed(&self, table: &str, record: Record) {
        let mut state = self.state.lock().await;
        let id = record_id(&record).unwrap();
        state.tables.entry(table.to_string()).or_default().insert(id, record);
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    /// Write calls only, in order.
    pub async fn writes(&self) -> Vec<RemoteCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| !matches!(c, RemoteCall::Read { .. }))
            .collect()
    }

    pub async fn reads(&self) -> Vec<(Query, RequestOptions)> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::Read { query, options } => Some((query, options)),
                _ => None,
            })
            .collect()
    }

    pub async fn server_record(&self, table: &str, id: &str) -> Option<Record> {
        let state = self.state.lock().await;
        state.tables.get(table).and_then(|rows| rows.get(id)).cloned()
    }
}

#[async_trait]
impl RemoteTableClient for MockRemote {
    async fn read(&self, query: &Query, options: &RequestOptions) -> Result<Vec<Record>> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Read {
            query: query.clone(),
            options: options.clone(),
        });
        Ok(state.pages.pop_front().unwrap_or_default())
    }

    async fn insert(
        &self,
        table: &str,
        record: Record,
        options: &RequestOptions,
    ) -> Result<Record> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Insert {
            table: table.to_string(),
            record: record.clone(),
            options: options.clone(),
        });

        let id = record_id(&record)?;
        if let Some(err) = state.take_failure(&id) {
            return Err(Error::Remote(err));
        }

        let stored = state.stamp(record);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        record: Record,
        options: &RequestOptions,
    ) -> Result<Record> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Update {
            table: table.to_string(),
            record: record.clone(),
            options: options.clone(),
        });

        let id = record_id(&record)?;
        if let Some(err) = state.take_failure(&id) {
            return Err(Error::Remote(err));
        }

        let stored = state.stamp(record);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, stored.clone());
        Ok(stored)
    }

    async fn del(
        &self,
        table: &str,
        id: &str,
        version: Option<&str>,
        options: &RequestOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RemoteCall::Delete {
            table: table.to_string(),
            id: id.to_string(),
            version: version.map(str::to_string),
            options: options.clone(),
        });

        if let Some(err) = state.take_failure(id) {
            return Err(Error::Remote(err));
        }

        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }
}
