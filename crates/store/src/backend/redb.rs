//! Redb (Rust embedded database) backend for embedfan collections.
//!
//! Each collection lives in its own table named `<database>.<collection>`,
//! keyed by the JSON text of the document `_id`, with the document stored as
//! JSON bytes. Replacing a collection deletes and rebuilds its table inside a
//! single write transaction, so readers see either the old or the new
//! contents and never a mix.

use crate::backend::assign_ids;
use crate::{ensure_id, Document, DocumentStore, StoreError};
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, TableHandle,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Redb-backed document store for a single database.
///
/// The `Arc<Database>` can be shared across threads; redb handles its own
/// locking and MVCC.
pub struct RedbStore {
    db: Arc<Database>,
    database: String,
}

impl RedbStore {
    /// Opens or creates the redb file at `path` and selects `database`.
    ///
    /// # Example
    /// ```no_run
    /// use store::RedbStore;
    ///
    /// let store = RedbStore::open("/tmp/embedfan.redb", "sample_mflix").unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, database: &str) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(StoreError::backend)?;
        Ok(Self {
            db: Arc::new(db),
            database: database.to_string(),
        })
    }

    /// Another database inside the same file.
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            db: Arc::clone(&self.db),
            database: database.to_string(),
        }
    }

    fn table_name(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection)
    }

    fn prefix(&self) -> String {
        format!("{}.", self.database)
    }
}

impl DocumentStore for RedbStore {
    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        let name = self.table_name(collection);
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_txn
                .open_table(table(&name))
                .map_err(StoreError::backend)?;
            let mut seen = HashSet::new();
            for mut doc in docs {
                let key = ensure_id(&mut doc);
                let exists = table
                    .get(key.as_str())
                    .map_err(StoreError::backend)?
                    .is_some();
                if exists || !seen.insert(key.clone()) {
                    // Dropping the uncommitted transaction discards the batch.
                    return Err(StoreError::DuplicateId {
                        collection: collection.to_string(),
                        id: key,
                    });
                }
                let bytes = serde_json::to_vec(&doc)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(StoreError::backend)?;
            }
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn replace(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        let rows = assign_ids(collection, HashSet::new(), docs)?;
        let name = self.table_name(collection);
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            write_txn
                .delete_table(table(&name))
                .map_err(StoreError::backend)?;
            let mut table = write_txn
                .open_table(table(&name))
                .map_err(StoreError::backend)?;
            for (key, doc) in rows {
                let bytes = serde_json::to_vec(&doc)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(StoreError::backend)?;
            }
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn scan(
        &self,
        collection: &str,
        visitor: &mut dyn FnMut(Document) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let name = self.table_name(collection);
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = match read_txn.open_table(table(&name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(StoreError::backend(e)),
        };

        for item in table.iter().map_err(StoreError::backend)? {
            let (_, value) = item.map_err(StoreError::backend)?;
            let doc: Document = serde_json::from_slice(value.value())?;
            visitor(doc)?;
        }

        Ok(())
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let name = self.table_name(collection);
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        match read_txn.open_table(table(&name)) {
            Ok(table) => Ok(table.len().map_err(StoreError::backend)? as usize),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        let name = self.table_name(collection);
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        write_txn
            .delete_table(table(&name))
            .map_err(StoreError::backend)?;
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let prefix = self.prefix();
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let mut names: Vec<String> = read_txn
            .list_tables()
            .map_err(StoreError::backend)?
            .filter_map(|handle| handle.name().strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
