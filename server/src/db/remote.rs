//! PostgreSQL-backed authoritative store.
//!
//! Every synced table shares one `sync_rows` table keyed by
//! `(table_name, id)`. Remote-assigned tables also store their business key
//! as JSONB under a partial unique index, which is what find-or-create
//! upserts look up.

use super::pool::{run_migrations, Pool};
use super::rows::{StoredRow, COLUMNS};
use async_trait::async_trait;
use paysync_engine::{
    BusinessKey, RecordId, Registry, RemoteError, RemoteKey, RemoteResult, RemoteRow,
    RemoteStore, TableName, Timestamp,
};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Modification stamp in milliseconds, strictly increasing per table.
const NEXT_STAMP: &str = "GREATEST(\
    (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT, \
    COALESCE((SELECT MAX(last_modified) FROM sync_rows WHERE table_name = $1), 0) + 1)";

/// [`RemoteStore`] over PostgreSQL.
pub struct PgRemoteStore {
    pool: Pool,
    registry: Registry,
    /// child table -> (foreign key field, parent table)
    parents: HashMap<TableName, Vec<(String, TableName)>>,
    schema: OnceCell<()>,
}

impl std::fmt::Debug for PgRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRemoteStore")
            .field("tables", &self.registry.len())
            .finish()
    }
}

impl PgRemoteStore {
    /// Create a store for the tables declared in `registry`.
    ///
    /// Declared dependents become foreign key checks: an upsert naming a
    /// parent row that does not exist is rejected as a conflict.
    pub fn new(pool: Pool, registry: Registry) -> Self {
        let parents = parent_refs(&registry);
        Self {
            pool,
            registry,
            parents,
            schema: OnceCell::new(),
        }
    }

    /// Run migrations once, on the first call that reaches the database.
    async fn ensure_schema(&self) -> RemoteResult<()> {
        self.schema
            .get_or_try_init(|| async {
                run_migrations(&self.pool)
                    .await
                    .map_err(|e| RemoteError::Network(format!("migrations failed: {}", e)))?;
                info!("Database schema ready");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Business key of a payload, when the table has one and every field is set.
    fn payload_key(&self, table: &str, payload: &Value) -> RemoteResult<Option<Value>> {
        let descriptor = self
            .registry
            .get(table)
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        if descriptor.business_key_fields.is_empty() {
            return Ok(None);
        }

        let mut key = BusinessKey::new();
        for field in &descriptor.business_key_fields {
            match payload.get(field) {
                None | Some(Value::Null) => return Ok(None),
                Some(value) => {
                    key.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(Some(key_json(&key)))
    }

    async fn check_parents(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        payload: &Value,
    ) -> RemoteResult<()> {
        let Some(refs) = self.parents.get(table) else {
            return Ok(());
        };
        for (field, parent) in refs {
            let Some(Value::String(parent_id)) = payload.get(field) else {
                continue;
            };
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sync_rows WHERE table_name = $1 AND id = $2)",
            )
            .bind(parent)
            .bind(parent_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_db_error)?;

            if !exists {
                return Err(RemoteError::Conflict(format!(
                    "{}.{} references missing {} row {}",
                    table, field, parent, parent_id
                )));
            }
        }
        Ok(())
    }

    async fn find_id(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        key: &Value,
    ) -> RemoteResult<Option<RecordId>> {
        sqlx::query_scalar("SELECT id FROM sync_rows WHERE table_name = $1 AND business_key = $2")
            .bind(table)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_error)
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn has_session(&self) -> RemoteResult<bool> {
        self.ensure_schema().await?;
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(true)
    }

    async fn upsert_by_key(
        &self,
        table: &str,
        key: &RemoteKey,
        payload: &Value,
    ) -> RemoteResult<RemoteRow> {
        self.ensure_schema().await?;
        let business_key = match key {
            RemoteKey::Business(key) => Some(key_json(key)),
            RemoteKey::Id(_) => self.payload_key(table, payload)?,
        };

        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        self.check_parents(&mut tx, table, payload).await?;

        let id = match key {
            RemoteKey::Id(id) => id.clone(),
            RemoteKey::Business(_) => {
                let existing = match &business_key {
                    Some(key) => Self::find_id(&mut tx, table, key).await?,
                    None => None,
                };
                match existing {
                    Some(id) => id,
                    None => sqlx::query_scalar("SELECT 'R-' || nextval('sync_row_ids')")
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(map_db_error)?,
                }
            }
        };

        let sql = format!(
            "INSERT INTO sync_rows (table_name, id, business_key, payload, last_modified) \
             VALUES ($1, $2, $3, $4, {}) \
             ON CONFLICT (table_name, id) DO UPDATE SET \
                 business_key = EXCLUDED.business_key, \
                 payload = EXCLUDED.payload, \
                 last_modified = EXCLUDED.last_modified \
             RETURNING {}",
            NEXT_STAMP, COLUMNS
        );
        let row = sqlx::query_as::<_, StoredRow>(&sql)
            .bind(table)
            .bind(&id)
            .bind(business_key)
            .bind(payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        debug!(table, id = %row.id, "Upserted row");
        Ok(row.into_remote_row())
    }

    async fn find_by_key(&self, table: &str, key: &RemoteKey) -> RemoteResult<Option<RemoteRow>> {
        self.ensure_schema().await?;
        let row = match key {
            RemoteKey::Id(id) => {
                let sql = format!(
                    "SELECT {} FROM sync_rows WHERE table_name = $1 AND id = $2",
                    COLUMNS
                );
                sqlx::query_as::<_, StoredRow>(&sql)
                    .bind(table)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            }
            RemoteKey::Business(key) => {
                let sql = format!(
                    "SELECT {} FROM sync_rows WHERE table_name = $1 AND business_key = $2",
                    COLUMNS
                );
                sqlx::query_as::<_, StoredRow>(&sql)
                    .bind(table)
                    .bind(key_json(key))
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(map_db_error)?;

        Ok(row.map(StoredRow::into_remote_row))
    }

    async fn list_changed_since(
        &self,
        table: &str,
        since: Timestamp,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {} FROM sync_rows \
             WHERE table_name = $1 AND last_modified >= $2 \
             ORDER BY last_modified, id \
             LIMIT $3",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, StoredRow>(&sql)
            .bind(table)
            .bind(i64::try_from(since).unwrap_or(i64::MAX))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(rows.into_iter().map(StoredRow::into_remote_row).collect())
    }

    async fn list_all_ids(&self, table: &str) -> RemoteResult<Vec<RecordId>> {
        self.ensure_schema().await?;
        sqlx::query_scalar("SELECT id FROM sync_rows WHERE table_name = $1 ORDER BY id")
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> RemoteResult<()> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM sync_rows WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }
}

fn key_json(key: &BusinessKey) -> Value {
    Value::Object(key.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn parent_refs(registry: &Registry) -> HashMap<TableName, Vec<(String, TableName)>> {
    let mut parents: HashMap<TableName, Vec<(String, TableName)>> = HashMap::new();
    for descriptor in registry.descriptors() {
        for dependent in &descriptor.dependents {
            parents
                .entry(dependent.table.clone())
                .or_default()
                .push((dependent.foreign_key_field.clone(), descriptor.table.clone()));
        }
    }
    parents
}

/// Map database failures onto the remote error taxonomy.
fn map_db_error(e: sqlx::Error) -> RemoteError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // unique_violation
            Some("23505") => RemoteError::Rejected(db.message().to_string()),
            // foreign_key_violation
            Some("23503") => RemoteError::Conflict(db.message().to_string()),
            // invalid_authorization_specification, invalid_password
            Some("28000") | Some("28P01") => RemoteError::Unauthorized,
            _ => RemoteError::Rejected(db.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RemoteError::Network(e.to_string()),
        _ => RemoteError::Rejected(e.to_string()),
    }
}
