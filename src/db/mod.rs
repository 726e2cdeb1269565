use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

pub mod models;

/// Whole-document key/value store on top of SQLite.
///
/// Every key holds one JSON document that is read and replaced as a unit
/// (last write wins). Documents read or written during this run are cached in
/// process, which is only correct while this process is the sole writer.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    cache: Arc<Mutex<HashMap<String, String>>>,
    /// Serialises read-modify-write cycles issued through `update`
    rmw: Arc<Mutex<()>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            cache: Arc::new(Mutex::new(HashMap::new())),
            rmw: Arc::new(Mutex::new(())),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Read the document stored under `key`. A missing key is `Ok(None)`.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result = self.read_raw(key).and_then(|raw| match raw {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .with_context(|| format!("Corrupt document under key '{}'", key)),
            None => Ok(None),
        });
        if let Err(e) = &result {
            error!("Document read failed for '{}': {:#}", key, e);
        }
        result
    }

    /// Replace the document stored under `key`.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialise document '{}'", key))?;
        let result = self.write_raw(key, body);
        if let Err(e) = &result {
            error!("Document write failed for '{}': {:#}", key, e);
        }
        result
    }

    /// Read, mutate and write back one document as a single step.
    ///
    /// Concurrent `update` calls never interleave, so no change is lost to a
    /// stale read.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _guard = lock(&self.rmw)?;
        let mut doc: T = self.read(key)?.unwrap_or_default();
        let out = f(&mut doc);
        self.write(key, &doc)?;
        Ok(out)
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>> {
        if let Some(hit) = lock(&self.cache)?.get(key) {
            return Ok(Some(hit.clone()));
        }

        let conn = lock(&self.conn)?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        if let Some(body) = &body {
            debug!("Document '{}' loaded from disk ({} bytes)", key, body.len());
            lock(&self.cache)?.insert(key.to_string(), body.clone());
        }
        Ok(body)
    }

    fn write_raw(&self, key: &str, body: String) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO documents (key, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                body=excluded.body,
                updated_at=excluded.updated_at",
            params![key, body, Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        lock(&self.cache)?.insert(key.to_string(), body);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("database mutex poisoned"))
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    key         TEXT    PRIMARY KEY,
    body        TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
);
"#;
