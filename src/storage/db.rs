use std::path::Path;

use redb::{Database, TableDefinition};

use super::{KeyValueStore, StoreError};

/// Token state entries: key -> value (UTF-8 strings)
const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("token_state");

/// redb-backed store for instances running as separate processes that
/// share a data directory.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("token-manager.redb");
        let db = Database::create(db_path).map_err(backend)?;

        // Create the table if it doesn't exist
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _ = write_txn.open_table(ENTRIES).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(Self { db })
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(ENTRIES).map_err(backend)?;
        let value = table
            .get(key)
            .map_err(backend)?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(ENTRIES).map_err(backend)?;
            table.insert(key, value).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(ENTRIES).map_err(backend)?;
            table.remove(key).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }
}
