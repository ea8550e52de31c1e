//! Shapes of the internal tables the sync engine keeps in the local store.

use tablesync_storage::{ColumnType, TableDefinition};

/// Columns of an operation-log row.
pub mod operation_columns {
    pub const ID: &str = "id";
    pub const TABLE_NAME: &str = "tableName";
    pub const ACTION: &str = "action";
    pub const ITEM_ID: &str = "itemId";
    pub const METADATA: &str = "metadata";
}

/// Columns of a watermark row.
pub mod pulltime_columns {
    pub const ID: &str = "id";
    pub const TABLE_NAME: &str = "tableName";
    pub const VALUE: &str = "value";
}

/// Definition of the operation-log table.
pub fn operation_table(name: &str) -> TableDefinition {
    TableDefinition::new(name)
        .column(operation_columns::ID, ColumnType::Integer)
        .column(operation_columns::TABLE_NAME, ColumnType::Text)
        .column(operation_columns::ACTION, ColumnType::Text)
        .column(operation_columns::ITEM_ID, ColumnType::Text)
        .column(operation_columns::METADATA, ColumnType::Object)
        .index([operation_columns::ID])
        .index([operation_columns::TABLE_NAME, operation_columns::ITEM_ID])
}

/// Definition of the incremental-pull watermark table.
pub fn pulltime_table(name: &str) -> TableDefinition {
    TableDefinition::new(name)
        .column(pulltime_columns::ID, ColumnType::Text)
        .column(pulltime_columns::TABLE_NAME, ColumnType::Text)
        .column(pulltime_columns::VALUE, ColumnType::Date)
        .index([pulltime_columns::TABLE_NAME])
}
