use crate::pipeline::{self, Pipeline};
use crate::{ensure_id, id_key, Document, StoreError, ID_FIELD};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// A document store bound to one database context.
///
/// Collections are created on first write. Reading a collection that does
/// not exist behaves like reading an empty one.
pub trait DocumentStore: Send + Sync {
    /// Appends documents to a collection. Documents without an `_id` get a
    /// fresh one; a duplicate `_id` rejects the whole batch.
    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError>;
    /// Replaces the contents of a collection with `docs`.
    fn replace(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError>;
    /// Visits every document of a collection.
    fn scan(
        &self,
        collection: &str,
        visitor: &mut dyn FnMut(Document) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    /// Number of documents in a collection.
    fn count(&self, collection: &str) -> Result<usize, StoreError>;
    /// Removes a collection and everything in it.
    fn drop_collection(&self, collection: &str) -> Result<(), StoreError>;
    /// Names of the collections in this database, sorted.
    fn collection_names(&self) -> Result<Vec<String>, StoreError>;

    /// Collects every document of a collection.
    fn find_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let mut docs = Vec::new();
        self.scan(collection, &mut |doc| {
            docs.push(doc);
            Ok(())
        })?;
        Ok(docs)
    }

    /// Runs a pipeline over a collection.
    ///
    /// With a trailing `out` stage the result overwrites the target collection
    /// and nothing is returned; otherwise the resulting rows are returned.
    fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> Result<Vec<Document>, StoreError> {
        pipeline.validate()?;
        let docs = self.find_all(collection)?;
        let rows = pipeline::evaluate(docs, pipeline.transforms())?;
        match pipeline.output() {
            Some(target) => {
                self.replace(target, rows)?;
                Ok(Vec::new())
            }
            None => Ok(rows),
        }
    }
}

/// Configuration for selecting and opening a store.
///
/// # Example
/// ```
/// use store::StoreConfig;
///
/// // In-memory (for testing)
/// let config = StoreConfig::in_memory();
///
/// // Redb file on disk
/// let config = StoreConfig::redb("/data/embedfan.redb");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StoreConfig {
    /// Ephemeral store; every `open` starts empty.
    #[default]
    InMemory,
    /// Embedded redb file at `path`.
    ///
    /// Requires the `backend-redb` feature (enabled by default).
    Redb { path: String },
    /// MongoDB deployment reachable at `uri`.
    ///
    /// Requires the `backend-mongo` feature.
    Mongo { uri: String },
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        StoreConfig::InMemory
    }

    pub fn redb<P: Into<String>>(path: P) -> Self {
        StoreConfig::Redb { path: path.into() }
    }

    pub fn mongo<U: Into<String>>(uri: U) -> Self {
        StoreConfig::Mongo { uri: uri.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::InMemory => "in_memory",
            StoreConfig::Redb { .. } => "redb",
            StoreConfig::Mongo { .. } => "mongo",
        }
    }

    /// Opens the store and selects `database` inside it.
    pub fn open(&self, database: &str) -> Result<Box<dyn DocumentStore>, StoreError> {
        match self {
            StoreConfig::InMemory => Ok(Box::new(InMemoryStore::new())),
            StoreConfig::Redb { path } => {
                #[cfg(feature = "backend-redb")]
                {
                    Ok(Box::new(RedbStore::open(path, database)?))
                }
                #[cfg(not(feature = "backend-redb"))]
                {
                    let _ = (path, database);
                    Err(StoreError::backend("redb backend disabled at compile time"))
                }
            }
            StoreConfig::Mongo { uri } => {
                #[cfg(feature = "backend-mongo")]
                {
                    Ok(Box::new(MongoStore::connect(uri, database)?))
                }
                #[cfg(not(feature = "backend-mongo"))]
                {
                    let _ = (uri, database);
                    Err(StoreError::backend("mongo backend disabled at compile time"))
                }
            }
        }
    }
}

/// Assigns missing identifiers and rejects any `_id` already in `taken` or
/// repeated within `docs`.
pub(crate) fn assign_ids(
    collection: &str,
    mut taken: HashSet<String>,
    docs: Vec<Document>,
) -> Result<Vec<(String, Document)>, StoreError> {
    let mut rows = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let key = ensure_id(&mut doc);
        if !taken.insert(key.clone()) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id: key,
            });
        }
        rows.push((key, doc));
    }
    Ok(rows)
}

/// An in-memory store: one `Vec` of documents per collection behind a `RwLock`.
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryStore {
    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        // A single write lock covers the duplicate check and the append.
        let mut guard = self
            .collections
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let taken: HashSet<String> = guard
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter_map(|d| d.get(ID_FIELD))
                    .map(id_key)
                    .collect()
            })
            .unwrap_or_default();
        let rows = assign_ids(collection, taken, docs)?;
        guard
            .entry(collection.to_string())
            .or_default()
            .extend(rows.into_iter().map(|(_, doc)| doc));
        Ok(())
    }

    fn replace(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        let rows = assign_ids(collection, HashSet::new(), docs)?;
        self.collections
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .insert(
                collection.to_string(),
                rows.into_iter().map(|(_, doc)| doc).collect(),
            );
        Ok(())
    }

    fn scan(
        &self,
        collection: &str,
        visitor: &mut dyn FnMut(Document) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        // Snapshot under the read lock so the visitor may call back into the store.
        let rows = {
            let guard = self
                .collections
                .read()
                .map_err(|_| StoreError::backend("poisoned lock"))?;
            guard.get(collection).cloned().unwrap_or_default()
        };
        for doc in rows {
            visitor(doc)?;
        }
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let guard = self
            .collections
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(guard.get(collection).map_or(0, Vec::len))
    }

    fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.collections
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .remove(collection);
        Ok(())
    }

    fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let guard = self
            .collections
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// The redb backend: an embedded, crash-safe file store.
#[cfg(feature = "backend-redb")]
pub mod redb;

#[cfg(feature = "backend-redb")]
pub use self::redb::RedbStore;

/// The MongoDB backend, driving the server's own aggregation framework.
#[cfg(feature = "backend-mongo")]
pub mod mongo;

#[cfg(feature = "backend-mongo")]
pub use self::mongo::MongoStore;
