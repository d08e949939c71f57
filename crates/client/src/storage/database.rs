//! SQLite persistence for multiplexer snapshots.
//!
//! Snapshots are stored as JSON under a key; the multiplexer uses a single
//! fixed key so a reload picks up the last saved layout.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::snapshot::MuxSnapshot;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Path error.
    #[error("Invalid database path: {0}")]
    InvalidPath(String),

    /// A stored snapshot could not be encoded or decoded.
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for database operations.
pub type StorageResult<T> = Result<T, DatabaseError>;

/// Key the multiplexer layout is stored under.
pub const LAYOUT_KEY: &str = "layout";

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Snapshot store backed by SQLite.
pub struct TabStore {
    conn: Connection,
}

impl TabStore {
    /// Open or create a store at the given path.
    ///
    /// Missing parent directories are created and pending migrations are
    /// applied.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StorageResult<i32> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn run_migrations(&mut self) -> StorageResult<()> {
        let current_version = self.schema_version()?;

        if current_version > CURRENT_SCHEMA_VERSION {
            return Err(DatabaseError::Migration(format!(
                "database schema version {} is newer than supported version {}",
                current_version, CURRENT_SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            self.migrate_v1()?;
        }

        Ok(())
    }

    /// Migration to version 1: snapshot table.
    fn migrate_v1(&mut self) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                saved_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        tx.execute(&format!("PRAGMA user_version = {}", 1), [])?;

        tx.commit()?;
        Ok(())
    }

    /// Saves the multiplexer layout, replacing the previous one.
    pub fn save(&self, snapshot: &MuxSnapshot) -> StorageResult<()> {
        self.save_as(LAYOUT_KEY, snapshot)
    }

    /// Loads the saved layout, if any.
    pub fn load(&self) -> StorageResult<Option<MuxSnapshot>> {
        self.load_from(LAYOUT_KEY)
    }

    /// Deletes the saved layout. Returns whether one existed.
    pub fn clear(&self) -> StorageResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM snapshots WHERE key = ?1", params![LAYOUT_KEY])?;
        Ok(rows_affected > 0)
    }

    /// Returns when the layout was last saved, as Unix seconds.
    pub fn saved_at(&self) -> StorageResult<Option<i64>> {
        let saved_at = self
            .conn
            .query_row(
                "SELECT saved_at FROM snapshots WHERE key = ?1",
                params![LAYOUT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(saved_at)
    }

    fn save_as(&self, key: &str, snapshot: &MuxSnapshot) -> StorageResult<()> {
        let payload = serde_json::to_string(snapshot)?;
        self.conn.execute(
            r#"
            INSERT INTO snapshots (key, payload, saved_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                saved_at = excluded.saved_at
            "#,
            params![key, payload, unix_now()],
        )?;
        Ok(())
    }

    fn load_from(&self, key: &str) -> StorageResult<Option<MuxSnapshot>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TabSnapshot;
    use protocol::Geometry;

    fn sample() -> MuxSnapshot {
        MuxSnapshot {
            tabs: vec![TabSnapshot {
                id: "term-1".to_string(),
                name: "Terminal 1".to_string(),
                session_id: "3b0c".to_string(),
                cwd: Some("/tmp".to_string()),
                geometry: Geometry { cols: 100, rows: 30 },
            }],
            active: Some("term-1".to_string()),
            next_seq: 2,
        }
    }

    #[test]
    fn test_in_memory_store() {
        let store = TabStore::open_in_memory().expect("Failed to create in-memory store");
        let version = store.schema_version().expect("Failed to get schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous_layout() {
        let store = TabStore::open_in_memory().unwrap();
        store.save(&sample()).unwrap();

        let mut newer = sample();
        newer.next_seq = 9;
        newer.active = None;
        store.save(&newer).unwrap();

        assert_eq!(store.load().unwrap(), Some(newer));
        assert!(store.saved_at().unwrap().is_some());
    }

    #[test]
    fn test_clear() {
        let store = TabStore::open_in_memory().unwrap();
        assert!(!store.clear().unwrap());
        store.save(&sample()).unwrap();
        assert!(store.clear().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_reported() {
        let store = TabStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO snapshots (key, payload, saved_at) VALUES (?1, 'not json', 0)",
                params![LAYOUT_KEY],
            )
            .unwrap();
        assert!(matches!(store.load(), Err(DatabaseError::Serialization(_))));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tabs.db");
        {
            let store = TabStore::open(&path).unwrap();
            store.conn.execute("PRAGMA user_version = 42", []).unwrap();
        }
        assert!(matches!(TabStore::open(&path), Err(DatabaseError::Migration(_))));
    }
}
