//! In-memory local store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use tablesync_common::{Error, Query, Record, RecordId, Result};

use crate::store::{
    check_delete_query, merge, row_id, DeleteTarget, LocalStore, StoreAction, StoreOperation,
    TableDefinition,
};

// Rows are keyed by `RecordId::key`, so `5` and `"5"` address the same row.
type Table = BTreeMap<String, Record>;

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    /// Create a new store with no tables.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn undefined(table: &str) -> Error {
    Error::Storage(format!("Table '{}' is not defined", table))
}

fn table_mut<'a>(tables: &'a mut HashMap<String, Table>, table: &str) -> Result<&'a mut Table> {
    tables.get_mut(table).ok_or_else(|| undefined(table))
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn define_table(&self, definition: &TableDefinition) -> Result<()> {
        definition.validate()?;
        let mut tables = self.tables.write().await;
        tables.entry(definition.name.clone()).or_default();
        debug!("Defined table {}", definition.name);
        Ok(())
    }

    async fn read(&self, query: &Query) -> Result<Vec<Record>> {
        let tables = self.tables.read().await;
        let table = tables.get(&query.table).ok_or_else(|| undefined(&query.table))?;
        Ok(query.apply(table.values().cloned()))
    }

    async fn lookup(
        &self,
        table: &str,
        id: &RecordId,
        suppress_not_found: bool,
    ) -> Result<Option<Record>> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or_else(|| undefined(table))?;

        match rows.get(&id.key()) {
            Some(record) => Ok(Some(record.clone())),
            None if suppress_not_found => Ok(None),
            None => Err(Error::NotFound(format!(
                "Record with id '{}' not found in table '{}'",
                id, table
            ))),
        }
    }

    async fn upsert(&self, table: &str, record: Record) -> Result<Record> {
        let id = row_id(table, &record)?.key();
        let mut tables = self.tables.write().await;
        let rows = table_mut(&mut tables, table)?;

        let merged = merge(rows.remove(&id), record);
        rows.insert(id, merged.clone());
        Ok(merged)
    }

    async fn del(&self, table: &str, target: DeleteTarget) -> Result<()> {
        let mut tables = self.tables.write().await;
        let rows = table_mut(&mut tables, table)?;

        match target {
            DeleteTarget::Ids(ids) => {
                for id in ids {
                    rows.remove(&id.key());
                }
            }
            DeleteTarget::Query(query) => {
                check_delete_query(table, &query)?;
                rows.retain(|_, record| !query.matches(record));
            }
        }
        Ok(())
    }

    async fn execute_batch(&self, operations: Vec<StoreOperation>) -> Result<()> {
        let mut tables = self.tables.write().await;

        // Validate everything up front so a failing batch leaves no trace.
        for operation in &operations {
            if !tables.contains_key(&operation.table) {
                return Err(undefined(&operation.table));
            }
            if let StoreAction::Upsert(record) = &operation.action {
                row_id(&operation.table, record)?;
            }
        }

        for operation in operations {
            let rows = table_mut(&mut tables, &operation.table)?;
            match operation.action {
                StoreAction::Upsert(record) => {
                    let id = row_id(&operation.table, &record)?.key();
                    let merged = merge(rows.remove(&id), record);
                    rows.insert(id, merged);
                }
                StoreAction::Delete(id) => {
                    rows.remove(&id.key());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnType;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn store_with_table() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .define_table(&TableDefinition::new("todo").column("id", ColumnType::Text))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = store_with_table().await;
        store.upsert("todo", record(json!({"id": "a", "text": "one"}))).await.unwrap();
        store.upsert("todo", record(json!({"id": "a", "done": true}))).await.unwrap();

        let found = store.lookup("todo", &RecordId::from("a"), false).await.unwrap();
        assert_eq!(found, Some(record(json!({"id": "a", "text": "one", "done": true}))));
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let store = store_with_table().await;
        let id = RecordId::from("missing");

        assert!(store.lookup("todo", &id, true).await.unwrap().is_none());
        assert!(matches!(
            store.lookup("todo", &id, false).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_undefined_table() {
        let store = MemoryStore::new();
        assert!(store.read(&Query::new("nope")).await.is_err());
        assert!(store.upsert("nope", record(json!({"id": "a"}))).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_by_query() {
        let store = store_with_table().await;
        for (id, done) in [("a", true), ("b", false), ("c", true)] {
            store.upsert("todo", record(json!({"id": id, "done": done}))).await.unwrap();
        }

        let query = Query::new("todo").where_eq("done", true);
        store.del("todo", DeleteTarget::Query(query)).await.unwrap();

        let remaining = store.read(&Query::new("todo")).await.unwrap();
        assert_eq!(remaining, vec![record(json!({"id": "b", "done": false}))]);

        let wrong_table = DeleteTarget::Query(Query::new("other"));
        assert!(store.del("todo", wrong_table).await.is_err());
    }

    #[tokio::test]
    async fn test_numeric_and_string_ids_match() {
        let store = store_with_table().await;
        store.upsert("todo", record(json!({"id": 7, "text": "seven"}))).await.unwrap();

        assert!(store.lookup("todo", &RecordId::from("7"), true).await.unwrap().is_some());
        store.del("todo", DeleteTarget::Ids(vec![RecordId::from("7")])).await.unwrap();
        assert!(store.lookup("todo", &RecordId::Int(7), true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let store = store_with_table().await;
        store.upsert("todo", record(json!({"id": "a"}))).await.unwrap();

        let result = store
            .execute_batch(vec![
                StoreOperation::delete("todo", "a"),
                StoreOperation::upsert("missing", record(json!({"id": "b"}))),
            ])
            .await;
        assert!(result.is_err());
        assert!(store.lookup("todo", &RecordId::from("a"), true).await.unwrap().is_some());

        store
            .execute_batch(vec![
                StoreOperation::delete("todo", "a"),
                StoreOperation::upsert("todo", record(json!({"id": "b"}))),
            ])
            .await
            .unwrap();
        let ids: Vec<Value> = store
            .read(&Query::new("todo"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("b")]);
    }
}
