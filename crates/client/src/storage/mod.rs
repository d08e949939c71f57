//! Storage module for the multiplexer client.
//!
//! SQLite-based persistence of the tab layout between reloads. Only the
//! layout survives; shell processes never do.

mod database;

pub use database::{CURRENT_SCHEMA_VERSION, DatabaseError, LAYOUT_KEY, StorageResult, TabStore};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MuxSnapshot;
    use tempfile::TempDir;

    fn create_test_store() -> (TabStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("nested").join("tabs.db");
        let store = TabStore::open(&db_path).expect("Failed to open store");
        (store, temp_dir)
    }

    #[test]
    fn test_store_creation() {
        let (store, _temp_dir) = create_test_store();
        let version = store
            .schema_version()
            .expect("Failed to get schema version");
        assert!(version > 0, "Schema version should be greater than 0");
    }

    #[test]
    fn test_layout_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("tabs.db");

        let snapshot = MuxSnapshot {
            tabs: Vec::new(),
            active: None,
            next_seq: 5,
        };
        TabStore::open(&db_path).unwrap().save(&snapshot).unwrap();

        let reopened = TabStore::open(&db_path).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(snapshot));
    }
}
