//! SQLite-backed plugin collection.

use super::{PluginStore, UpsertOutcome};
use crate::config::StoreConfig;
use crate::decode::parse_date;
use crate::error::StoreError;
use crate::plugin::Plugin;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `config.path`. `:memory:`
    /// opens a private in-memory database.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let table = valid_table_name(&config.collection)?;
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory().map_err(unavailable)?
        } else {
            let path = Path::new(&config.path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
            let conn = Connection::open(path).map_err(unavailable)?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                ",
            )
            .map_err(unavailable)?;
            conn
        };
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(unavailable)?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                script_id     TEXT PRIMARY KEY NOT NULL,
                modified_date TEXT,
                document      TEXT NOT NULL,
                synced_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_modified_date ON {table} (modified_date);"
        ))
        .map_err(unavailable)?;

        debug!(path = %config.path, table = %table, "opened plugin store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    /// Run `f` on the blocking pool with exclusive use of the connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&mut guard, &table)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn valid_table_name(name: &str) -> Result<String, StoreError> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(name.to_string())
    } else {
        Err(StoreError::Unavailable(format!("invalid collection name {:?}", name)))
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Busy, locked and constraint failures concern one write; anything else
/// means the store itself is broken.
fn classify(script_id: &str, e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation) => {
            StoreError::Conflict {
                script_id: script_id.to_string(),
                message: e.to_string(),
            }
        }
        _ => unavailable(e),
    }
}

fn date_string(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

#[async_trait]
impl PluginStore for SqliteStore {
    async fn upsert(&self, plugin: &Plugin) -> Result<UpsertOutcome, StoreError> {
        let script_id = plugin.script_id.clone();
        let modified = plugin.modified_date;
        let document = serde_json::to_string(&plugin.to_document())
            .map_err(|e| StoreError::Document(e.to_string()))?;

        self.with_conn(move |conn, table| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| classify(&script_id, e))?;

            let stored: Option<Option<String>> = tx
                .query_row(
                    &format!("SELECT modified_date FROM {table} WHERE script_id = ?1"),
                    params![script_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| classify(&script_id, e))?;

            let outcome = match stored {
                None => UpsertOutcome::Inserted,
                Some(date) if modified < date.as_deref().and_then(parse_date) => {
                    return Ok(UpsertOutcome::Stale);
                }
                Some(_) => UpsertOutcome::Updated,
            };

            tx.execute(
                &format!(
                    "INSERT INTO {table} (script_id, modified_date, document, synced_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(script_id) DO UPDATE SET
                        modified_date = excluded.modified_date,
                        document = excluded.document,
                        synced_at = excluded.synced_at"
                ),
                params![script_id, date_string(modified), document, Utc::now().to_rfc3339()],
            )
            .map_err(|e| classify(&script_id, e))?;
            tx.commit().map_err(|e| classify(&script_id, e))?;
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, script_id: &str) -> Result<Option<Plugin>, StoreError> {
        let script_id = script_id.to_string();
        let document: Option<String> = self
            .with_conn(move |conn, table| {
                conn.query_row(
                    &format!("SELECT document FROM {table} WHERE script_id = ?1"),
                    params![script_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)
            })
            .await?;

        let Some(document) = document else {
            return Ok(None);
        };
        let doc: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&document).map_err(|e| StoreError::Document(e.to_string()))?;
        Plugin::from_document(doc)
            .map(Some)
            .map_err(|e| StoreError::Document(e.to_string()))
    }

    async fn watermark(&self) -> Result<Option<NaiveDate>, StoreError> {
        let latest: Option<String> = self
            .with_conn(|conn, table| {
                conn.query_row(&format!("SELECT MAX(modified_date) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .map_err(unavailable)
            })
            .await?;
        Ok(latest.as_deref().and_then(parse_date))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .with_conn(|conn, table| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .map_err(unavailable)
            })
            .await?;
        Ok(n.max(0) as u64)
    }
}
