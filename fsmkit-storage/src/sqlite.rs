//! SQLite-backed state store.
//!
//! One row per `(machine_id, entity_id)`, keyed by the unique `store_key`
//! column (`machine:entity`). Timestamps are RFC 3339 text with nanosecond
//! precision; the context is stored as JSON text.

use crate::error::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use fsmkit_core::{store_key, Context, StateRecord, StateStore, StoreError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default table name.
pub const DEFAULT_TABLE: &str = "fsm_state_record";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Database file.
    pub path: PathBuf,
    /// Table holding the records.
    #[serde(default = "default_table")]
    pub table: String,
    /// Create the table when it does not exist.
    #[serde(default = "default_auto_create")]
    pub auto_create_table: bool,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_auto_create() -> bool {
    true
}

impl SqliteStoreConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            table: default_table(),
            auto_create_table: true,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_auto_create_table(mut self, enabled: bool) -> Self {
        self.auto_create_table = enabled;
        self
    }

    /// The table name is interpolated into SQL, so it must be a plain
    /// identifier.
    pub fn validate(&self) -> Result<(), StorageError> {
        let mut chars = self.table.chars();
        let valid = self.table.len() <= 64
            && chars
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false)
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid {
            return Err(StorageError::InvalidConfig(format!(
                "invalid table name '{}'",
                self.table
            )));
        }
        Ok(())
    }
}

/// Durable [`StateStore`] on a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteStore {
    /// Opens (or creates) the database file.
    pub fn open(config: SqliteStoreConfig) -> Result<Self, StorageError> {
        config.validate()?;

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;

        tracing::info!(path = %config.path.display(), table = %config.table, "opened sqlite store");
        Self::with_connection(conn, &config)
    }

    /// Opens a private in-memory database with the default table.
    pub fn in_memory() -> Result<Self, StorageError> {
        let config = SqliteStoreConfig::new(":memory:");
        Self::with_connection(Connection::open_in_memory()?, &config)
    }

    fn with_connection(conn: Connection, config: &SqliteStoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            conn: Mutex::new(conn),
            table: config.table.clone(),
        };
        if config.auto_create_table {
            store.create_table()?;
        }
        Ok(store)
    }

    /// Creates the record table and its machine index if missing.
    pub fn create_table(&self) -> Result<(), StorageError> {
        let t = &self.table;
        self.conn.lock().execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                store_key TEXT NOT NULL UNIQUE,
                machine_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                current_state TEXT NOT NULL,
                previous_state TEXT,
                state_changed_at TEXT NOT NULL,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_machine ON {t}(machine_id);
            "#
        ))?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count: i64 = self.conn.lock().query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Row bookkeeping times `(created_at, updated_at)` for a key.
    pub fn row_times(
        &self,
        machine_id: &str,
        entity_id: &str,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        let sql = format!(
            "SELECT created_at, updated_at FROM {} WHERE store_key = ?1",
            self.table
        );
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .query_row(&sql, params![store_key(machine_id, entity_id)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        row.map(|(created, updated)| -> Result<_, StorageError> {
            Ok((parse_timestamp(&created)?, parse_timestamp(&updated)?))
        })
        .transpose()
    }

    fn upsert(&self, record: &StateRecord) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                store_key, machine_id, entity_id, current_state, previous_state,
                state_changed_at, context, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(store_key) DO UPDATE SET
                current_state = excluded.current_state,
                previous_state = excluded.previous_state,
                state_changed_at = excluded.state_changed_at,
                context = excluded.context,
                updated_at = excluded.updated_at
            "#,
            self.table
        );

        let context = serde_json::to_string(&record.context)?;
        self.conn.lock().execute(
            &sql,
            params![
                record.store_key(),
                record.machine_id,
                record.entity_id,
                record.current_state,
                record.previous_state,
                format_timestamp(record.state_changed_at),
                context,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn select(&self, machine_id: &str, entity_id: &str) -> Result<Option<StateRecord>, StorageError> {
        let key = store_key(machine_id, entity_id);
        let sql = format!(
            r#"
            SELECT machine_id, entity_id, current_state, previous_state, state_changed_at, context
            FROM {}
            WHERE store_key = ?1
            "#,
            self.table
        );

        let row = self
            .conn
            .lock()
            .query_row(&sql, params![key], |row| {
                Ok(RecordRow {
                    machine_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    current_state: row.get(2)?,
                    previous_state: row.get(3)?,
                    state_changed_at: row.get(4)?,
                    context: row.get(5)?,
                })
            })
            .optional()?;

        row.map(|r| r.into_record(&key)).transpose()
    }

    fn delete(&self, machine_id: &str, entity_id: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM {} WHERE store_key = ?1", self.table);
        let changed = self
            .conn
            .lock()
            .execute(&sql, params![store_key(machine_id, entity_id)])?;
        Ok(changed > 0)
    }

    fn contains(&self, machine_id: &str, entity_id: &str) -> Result<bool, StorageError> {
        let sql = format!("SELECT 1 FROM {} WHERE store_key = ?1 LIMIT 1", self.table);
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row(&sql, params![store_key(machine_id, entity_id)], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn entity_ids(&self, machine_id: &str) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT entity_id FROM {} WHERE machine_id = ?1 ORDER BY entity_id",
            self.table
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![machine_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

impl StateStore for SqliteStore {
    fn save(&self, record: &StateRecord) -> Result<(), StoreError> {
        Ok(self.upsert(record)?)
    }

    fn find(&self, machine_id: &str, entity_id: &str) -> Result<Option<StateRecord>, StoreError> {
        Ok(self.select(machine_id, entity_id)?)
    }

    fn remove(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self.delete(machine_id, entity_id)?)
    }

    fn exists(&self, machine_id: &str, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self.contains(machine_id, entity_id)?)
    }

    fn entities(&self, machine_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.entity_ids(machine_id)?)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

struct RecordRow {
    machine_id: String,
    entity_id: String,
    current_state: String,
    previous_state: Option<String>,
    state_changed_at: String,
    context: String,
}

impl RecordRow {
    fn into_record(self, key: &str) -> Result<StateRecord, StorageError> {
        let context: Context = match serde_json::from_str(&self.context)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(StorageError::Corruption {
                    key: key.to_string(),
                    reason: format!("context is not a JSON object: {}", other),
                })
            }
        };

        Ok(StateRecord {
            machine_id: self.machine_id,
            entity_id: self.entity_id,
            current_state: self.current_state,
            previous_state: self.previous_state,
            state_changed_at: parse_timestamp(&self.state_changed_at)?,
            context,
        })
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
