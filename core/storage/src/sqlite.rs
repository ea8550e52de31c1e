//! SQLite-backed local store.
//!
//! Each table is stored as `(id TEXT PRIMARY KEY, data TEXT)` where `data`
//! holds the record as JSON. Filters SQLite can evaluate exactly (string and
//! boolean equality, numeric comparisons on plain field names) run as
//! `json_extract` predicates, which declared indexes serve. Ordering and
//! paging also run in SQL when every filter was translated and every sort key
//! is a declared numeric column. Whatever remains is evaluated in memory.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use tablesync_common::{Comparison, Error, Filter, Literal, Query, Record, RecordId, Result};

use crate::store::{
    check_delete_query, is_simple_field, merge, row_id, ColumnType, DeleteTarget, LocalStore,
    StoreAction, StoreOperation, TableDefinition,
};

/// Local store persisted in a SQLite database.
pub struct SqliteStore {
    db: Mutex<Database>,
}

struct Database {
    conn: Connection,
    // Column types of the tables defined through this handle.
    columns: HashMap<String, BTreeMap<String, ColumnType>>,
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn quote(table: &str) -> Result<String> {
    if table.is_empty() || table.contains('"') || table.contains('\0') {
        return Err(Error::InvalidInput(format!("invalid table name '{}'", table)));
    }
    Ok(format!("\"{}\"", table))
}

fn ensure_table(conn: &Connection, table: &str) -> Result<String> {
    let quoted = quote(table)?;
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()
        .map_err(storage_err)?;

    match exists {
        Some(()) => Ok(quoted),
        None => Err(Error::Storage(format!("Table '{}' is not defined", table))),
    }
}

/// `json_extract` path of a plain field name.
fn json_path(field: &str) -> Option<String> {
    is_simple_field(field).then(|| format!("'$.{}'", field))
}

/// SQL for one filter, or `None` when SQLite cannot match it exactly.
fn filter_sql(filter: &Filter, params: &mut Vec<SqlValue>) -> Option<String> {
    let path = json_path(&filter.field)?;
    let value = match &filter.literal {
        Literal::Value(value) => value,
        Literal::DateTime(_) => return None,
    };

    match (filter.comparison, value) {
        (Comparison::Eq, Value::String(text)) => {
            params.push(SqlValue::Text(text.clone()));
            Some(format!(
                "(json_type(data, {0}) = 'text' AND json_extract(data, {0}) = ?{1})",
                path,
                params.len()
            ))
        }
        (Comparison::Eq, Value::Bool(flag)) => Some(format!(
            "json_type(data, {}) = '{}'",
            path,
            if *flag { "true" } else { "false" }
        )),
        (comparison, Value::Number(number)) => {
            let op = match comparison {
                Comparison::Eq => "=",
                Comparison::Gt => ">",
                Comparison::Ge => ">=",
                Comparison::Lt => "<",
                Comparison::Le => "<=",
                // Also holds for non-numbers, which SQL would drop.
                Comparison::Ne => return None,
            };
            let bound = match number.as_i64() {
                Some(int) => SqlValue::Integer(int),
                None => SqlValue::Real(number.as_f64()?),
            };
            params.push(bound);
            Some(format!(
                "(json_type(data, {0}) IN ('integer', 'real') AND json_extract(data, {0}) {1} ?{2})",
                path,
                op,
                params.len()
            ))
        }
        _ => None,
    }
}

/// The part of a query SQLite evaluates itself.
struct SqlPlan {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
    /// Every filter was translated.
    exact: bool,
    /// `ORDER BY` list matching the query's ordering, if it can run in SQL.
    order: Option<String>,
    /// `json_extract` paths of the sort keys.
    order_paths: Vec<String>,
}

impl SqlPlan {
    fn new(query: &Query, columns: Option<&BTreeMap<String, ColumnType>>) -> Self {
        let mut params = Vec::new();
        let mut conditions = Vec::new();
        let mut exact = true;
        for filter in &query.filters {
            match filter_sql(filter, &mut params) {
                Some(condition) => conditions.push(condition),
                None => exact = false,
            }
        }

        let mut keys = Vec::new();
        let mut order_paths = Vec::new();
        for key in &query.ordering {
            let numeric = columns
                .and_then(|c| c.get(&key.field))
                .map_or(false, |t| matches!(t, ColumnType::Integer | ColumnType::Real));
            match json_path(&key.field) {
                Some(path) if numeric => {
                    keys.push(format!(
                        "json_extract(data, {}) {}",
                        path,
                        if key.descending { "DESC" } else { "ASC" }
                    ));
                    order_paths.push(path);
                }
                _ => break,
            }
        }
        let order = (keys.len() == query.ordering.len()).then(|| {
            // Ties keep id order, the order records are loaded in.
            keys.push("id".to_string());
            keys.join(", ")
        });

        Self {
            conditions,
            params,
            exact,
            order,
            order_paths,
        }
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    /// Whether `LIMIT`/`OFFSET` in SQL select the same rows as the query.
    ///
    /// SQLite sorts text after numbers while in-memory ordering does not, so
    /// the sort keys must hold only numbers or nulls.
    fn pages_in_sql(&self, conn: &Connection, quoted: &str) -> Result<bool> {
        if !self.exact || self.order.is_none() {
            return Ok(false);
        }
        for path in &self.order_paths {
            let mixed = conn
                .query_row(
                    &format!(
                        "SELECT 1 FROM {} WHERE json_type(data, {}) NOT IN ('integer', 'real', 'null') LIMIT 1",
                        quoted, path
                    ),
                    [],
                    |_| Ok(()),
                )
                .optional()
                .map_err(storage_err)?;
            if mixed.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn load_row(conn: &Connection, quoted: &str, key: &str) -> Result<Option<Record>> {
    let data: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {} WHERE id = ?1", quoted),
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;

    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn load_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))
        .map_err(storage_err)?;

    let mut records = Vec::new();
    for row in rows {
        let json = row.map_err(storage_err)?;
        records.push(serde_json::from_str(&json)?);
    }
    Ok(records)
}

fn upsert_row(conn: &Connection, table: &str, record: Record) -> Result<Record> {
    let quoted = ensure_table(conn, table)?;
    let key = row_id(table, &record)?.key();

    let merged = merge(load_row(conn, &quoted, &key)?, record);
    let json = serde_json::to_string(&merged)?;

    conn.execute(
        &format!("INSERT OR REPLACE INTO {} (id, data) VALUES (?1, ?2)", quoted),
        params![key, json],
    )
    .map_err(storage_err)?;
    Ok(merged)
}

fn delete_row(conn: &Connection, table: &str, id: &RecordId) -> Result<()> {
    let quoted = ensure_table(conn, table)?;
    conn.execute(&format!("DELETE FROM {} WHERE id = ?1", quoted), [id.key()])
        .map_err(storage_err)?;
    Ok(())
}

fn create_indexes(conn: &Connection, definition: &TableDefinition, quoted: &str) -> Result<()> {
    for columns in &definition.indexes {
        let expressions = columns
            .iter()
            .map(|c| {
                json_path(c)
                    .map(|path| format!("json_extract(data, {})", path))
                    .ok_or_else(|| Error::InvalidInput(format!("cannot index column '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()?;
        let name = quote(&format!("{}_{}_idx", definition.name, columns.join("_")))?;

        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
            name,
            quoted,
            expressions.join(", ")
        ))
        .map_err(storage_err)?;
    }
    Ok(())
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(Self {
            db: Mutex::new(Database {
                conn,
                columns: HashMap::new(),
            }),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Names of the tables present in the database.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(storage_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(names)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn define_table(&self, definition: &TableDefinition) -> Result<()> {
        definition.validate()?;
        let quoted = quote(&definition.name)?;

        let mut db = self.db.lock().await;
        db.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT NOT NULL);",
                quoted
            ))
            .map_err(storage_err)?;
        create_indexes(&db.conn, definition, &quoted)?;
        db.columns
            .insert(definition.name.clone(), definition.columns.clone());

        debug!("Defined table {}", definition.name);
        Ok(())
    }

    async fn read(&self, query: &Query) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        let quoted = ensure_table(&db.conn, &query.table)?;
        let plan = SqlPlan::new(query, db.columns.get(&query.table));

        let paged = query.skip.is_some() || query.take.is_some();
        let mut rest = query.clone();
        let sql = match plan.order.as_deref() {
            Some(order) if paged && plan.pages_in_sql(&db.conn, &quoted)? => {
                let limit = query
                    .take
                    .map_or(-1, |take| i64::try_from(take).unwrap_or(i64::MAX));
                rest.skip = None;
                rest.take = None;
                format!(
                    "SELECT data FROM {}{} ORDER BY {} LIMIT {} OFFSET {}",
                    quoted,
                    plan.where_clause(),
                    order,
                    limit,
                    query.skip.unwrap_or(0)
                )
            }
            _ => format!("SELECT data FROM {}{} ORDER BY id", quoted, plan.where_clause()),
        };

        let records = load_rows(&db.conn, &sql, &plan.params)?;
        Ok(rest.apply(records))
    }

    async fn lookup(
        &self,
        table: &str,
        id: &RecordId,
        suppress_not_found: bool,
    ) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        let quoted = ensure_table(&db.conn, table)?;

        match load_row(&db.conn, &quoted, &id.key())? {
            Some(record) => Ok(Some(record)),
            None if suppress_not_found => Ok(None),
            None => Err(Error::NotFound(format!(
                "Record with id '{}' not found in table '{}'",
                id, table
            ))),
        }
    }

    async fn upsert(&self, table: &str, record: Record) -> Result<Record> {
        let db = self.db.lock().await;
        upsert_row(&db.conn, table, record)
    }

    async fn del(&self, table: &str, target: DeleteTarget) -> Result<()> {
        let mut db = self.db.lock().await;
        let db = &mut *db;
        let tx = db.conn.transaction().map_err(storage_err)?;

        match target {
            DeleteTarget::Ids(ids) => {
                for id in &ids {
                    delete_row(&tx, table, id)?;
                }
            }
            DeleteTarget::Query(query) => {
                check_delete_query(table, &query)?;
                let quoted = ensure_table(&tx, table)?;
                let plan = SqlPlan::new(&query, db.columns.get(table));

                if plan.exact {
                    tx.execute(
                        &format!("DELETE FROM {}{}", quoted, plan.where_clause()),
                        params_from_iter(plan.params.iter()),
                    )
                    .map_err(storage_err)?;
                } else {
                    let sql = format!("SELECT data FROM {}{}", quoted, plan.where_clause());
                    for record in load_rows(&tx, &sql, &plan.params)? {
                        if query.matches(&record) {
                            delete_row(&tx, table, &row_id(table, &record)?)?;
                        }
                    }
                }
            }
        }

        tx.commit().map_err(storage_err)
    }

    async fn execute_batch(&self, operations: Vec<StoreOperation>) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.conn.transaction().map_err(storage_err)?;

        for operation in operations {
            match operation.action {
                StoreAction::Upsert(record) => {
                    upsert_row(&tx, &operation.table, record)?;
                }
                StoreAction::Delete(id) => delete_row(&tx, &operation.table, &id)?,
            }
        }

        // Dropping an uncommitted transaction rolls it back.
        tx.commit().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn todo_table() -> TableDefinition {
        TableDefinition::new("todo")
            .column("id", ColumnType::Text)
            .column("text", ColumnType::Text)
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.define_table(&todo_table()).await.unwrap();
            store.upsert("todo", record(json!({"id": "a", "text": "hi"}))).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let found = store.lookup("todo", &RecordId::from("a"), false).await.unwrap();
        assert_eq!(found, Some(record(json!({"id": "a", "text": "hi"}))));
        assert_eq!(store.table_names().await.unwrap(), vec!["todo".to_string()]);
    }

    #[tokio::test]
    async fn test_read_applies_query() {
        let store = SqliteStore::in_memory().unwrap();
        store.define_table(&todo_table()).await.unwrap();
        for (id, n) in [("a", 3), ("b", 1), ("c", 2)] {
            store.upsert("todo", record(json!({"id": id, "n": n}))).await.unwrap();
        }

        let query = Query::new("todo").order_by("n").take(2);
        let records = store.read(&query).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_integer_ids() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .define_table(&TableDefinition::new("__operations").column("id", ColumnType::Integer))
            .await
            .unwrap();
        store
            .upsert("__operations", record(json!({"id": 7, "action": "insert"})))
            .await
            .unwrap();

        let found = store
            .lookup("__operations", &RecordId::Int(7), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["id"], json!(7));

        store
            .del("__operations", DeleteTarget::Ids(vec![RecordId::Int(7)]))
            .await
            .unwrap();
        assert!(store
            .lookup("__operations", &RecordId::Int(7), true)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_batch_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        store.define_table(&todo_table()).await.unwrap();
        store.upsert("todo", record(json!({"id": "a"}))).await.unwrap();

        let result = store
            .execute_batch(vec![
                StoreOperation::delete("todo", "a"),
                StoreOperation::upsert("undefined", record(json!({"id": "b"}))),
            ])
            .await;

        assert!(result.is_err());
        assert!(store.lookup("todo", &RecordId::from("a"), true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_by_query() {
        let store = SqliteStore::in_memory().unwrap();
        store.define_table(&todo_table()).await.unwrap();
        store.upsert("todo", record(json!({"id": "a", "done": true}))).await.unwrap();
        store.upsert("todo", record(json!({"id": "b", "done": false}))).await.unwrap();

        let query = Query::new("todo").where_eq("done", true);
        store.del("todo", DeleteTarget::Query(query)).await.unwrap();

        let remaining = store.read(&Query::new("todo")).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["id"], json!("b"));
    }

    fn mixed_rows() -> Vec<Record> {
        vec![
            record(json!({"id": "a", "n": 1, "done": true, "text": "1"})),
            record(json!({"id": "b", "n": "1", "done": "true", "text": 1})),
            record(json!({"id": "c", "n": 2.5, "done": false})),
            record(json!({"id": "d", "text": "2024-01-01T00:00:00Z"})),
            record(json!({"id": "e", "n": {"x": 1}, "done": null, "text": "2024-01-01T00:00:00.000Z"})),
            record(json!({"id": "f", "n": -3, "text": "z"})),
        ]
    }

    fn number_table() -> TableDefinition {
        todo_table()
            .column("n", ColumnType::Integer)
            .column("done", ColumnType::Boolean)
            .index(["n"])
            .index(["text", "done"])
    }

    #[tokio::test]
    async fn test_define_table_creates_indexes() {
        let store = SqliteStore::in_memory().unwrap();
        store.define_table(&number_table()).await.unwrap();
        // Defining again is a no-op.
        store.define_table(&number_table()).await.unwrap();

        let db = store.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'index' AND tbl_name = 'todo' AND sql IS NOT NULL ORDER BY name",
            )
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["todo_n_idx".to_string(), "todo_text_done_idx".to_string()]);
    }

    #[tokio::test]
    async fn test_read_matches_memory_store() {
        let sqlite = SqliteStore::in_memory().unwrap();
        let memory = MemoryStore::new();
        let stores: [&dyn LocalStore; 2] = [&sqlite, &memory];
        for store in stores {
            store.define_table(&number_table()).await.unwrap();
            for row in mixed_rows() {
                store.upsert("todo", row).await.unwrap();
            }
        }

        let queries = vec![
            Query::new("todo"),
            Query::new("todo").where_eq("n", 1i64),
            Query::new("todo").filter("n", Comparison::Gt, 0i64),
            Query::new("todo").filter("n", Comparison::Le, 1i64),
            Query::new("todo").filter("n", Comparison::Ne, 1i64),
            Query::new("todo").where_eq("done", true),
            Query::new("todo").where_eq("done", false),
            Query::new("todo").where_eq("text", "1"),
            Query::new("todo").where_eq("text", "2024-01-01T00:00:00Z"),
            Query::new("todo").where_eq("n", Value::Null),
            Query::new("todo").order_by("n").take(3),
            Query::new("todo").where_eq("text", "z").order_by_descending("n").skip(0).take(1),
        ];
        for query in queries {
            assert_eq!(
                sqlite.read(&query).await.unwrap(),
                memory.read(&query).await.unwrap(),
                "{:?}",
                query
            );
        }
    }

    #[tokio::test]
    async fn test_paging_on_numeric_column() {
        let store = SqliteStore::in_memory().unwrap();
        store.define_table(&number_table()).await.unwrap();
        let rows = [
            ("a", json!(3)),
            ("b", json!(1)),
            ("c", Value::Null),
            ("d", json!(2.5)),
            ("e", json!(3)),
        ];
        for (id, n) in rows {
            store.upsert("todo", record(json!({"id": id, "n": n}))).await.unwrap();
        }

        let query = Query::new("todo").order_by_descending("n").skip(1).take(3);
        let records = store.read(&query).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["e", "d", "b"]);

        let query = Query::new("todo")
            .filter("n", Comparison::Ge, 1i64)
            .order_by("n")
            .skip(2)
            .select(["id"]);
        let records = store.read(&query).await.unwrap();
        assert_eq!(records, vec![record(json!({"id": "a"})), record(json!({"id": "e"}))]);
    }

    #[tokio::test]
    async fn test_delete_by_inexact_query() {
        let sqlite = SqliteStore::in_memory().unwrap();
        let memory = MemoryStore::new();
        let stores: [&dyn LocalStore; 2] = [&sqlite, &memory];
        for store in stores {
            store.define_table(&number_table()).await.unwrap();
            for row in mixed_rows() {
                store.upsert("todo", row).await.unwrap();
            }
            let query = Query::new("todo")
                .filter("n", Comparison::Ne, 1i64)
                .filter("n", Comparison::Lt, 3i64);
            store.del("todo", DeleteTarget::Query(query)).await.unwrap();
        }

        let remaining = sqlite.read(&Query::new("todo")).await.unwrap();
        assert_eq!(remaining, memory.read(&Query::new("todo")).await.unwrap());
        let ids: Vec<&str> = remaining.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "d", "e"]);
    }
}
