use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use delve_core::error::{DelveError, Result};
use delve_core::traits::StateStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS run_snapshots (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

/// SQLite-backed run-state store. One row per run id, upserted on save.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DelveError::Persistence(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode so status reads don't block checkpoints
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DelveError::Persistence(e.to_string()))?;
        f(&conn).map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> DelveError {
    DelveError::Persistence(e.to_string())
}

impl StateStore for SqliteStore {
    fn save(&self, id: &str, data: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let text = serde_json::to_string(&data)
                .map_err(|e| DelveError::Serialization(e.to_string()))?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO run_snapshots (id, data, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                    params![id, text, Utc::now().to_rfc3339()],
                )
            })?;
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let id = id.to_string();
        Box::pin(async move {
            let text: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT data FROM run_snapshots WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })?;

            text.map(|t| {
                serde_json::from_str(&t).map_err(|e| DelveError::Serialization(e.to_string()))
            })
            .transpose()
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let deleted = self.with_conn(|conn| {
                conn.execute("DELETE FROM run_snapshots WHERE id = ?1", params![id])
            })?;
            Ok(deleted > 0)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let count: i64 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM run_snapshots WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
            })?;
            Ok(count > 0)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM run_snapshots ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
        })
    }
}
