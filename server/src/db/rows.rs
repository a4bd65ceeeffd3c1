//! Row mapping for the `sync_rows` table.

use paysync_engine::RemoteRow;
use sqlx::Row;

/// A stored row from the database.
#[derive(Debug)]
pub struct StoredRow {
    pub table_name: String,
    pub id: String,
    pub payload: serde_json::Value,
    pub last_modified: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRow {
            table_name: row.try_get("table_name")?,
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            last_modified: row.try_get("last_modified")?,
        })
    }
}

impl StoredRow {
    /// Convert a database row to the engine's remote row.
    pub fn into_remote_row(self) -> RemoteRow {
        RemoteRow {
            id: self.id,
            table: self.table_name,
            payload: self.payload,
            last_modified: self.last_modified.max(0) as u64,
        }
    }
}

/// Columns selected for [`StoredRow`].
pub(super) const COLUMNS: &str = "table_name, id, payload, last_modified";
