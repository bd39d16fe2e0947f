//! # embedfan store
//!
//! A small document store with a typed aggregation pipeline. Documents are
//! plain JSON objects grouped into named collections inside a database
//! context, and every collection write is either an append
//! ([`DocumentStore::insert_many`]) or a full overwrite
//! ([`DocumentStore::replace`]).
//!
//! ## Backends
//!
//! All backends implement the [`DocumentStore`] trait:
//! - [`InMemoryStore`]: a `RwLock` around per-collection vectors. Ideal for tests.
//! - `RedbStore`: an embedded, on-disk store (feature `backend-redb`, on by default).
//!   One redb table per `database.collection`.
//! - `MongoStore`: a MongoDB database (feature `backend-mongo`). Pipelines are
//!   translated into native aggregation stages and run server side.
//!
//! ## Pipelines
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. The in-process backends
//! evaluate it with [`pipeline::evaluate`]; a trailing [`Stage::Out`]
//! materializes the result into a named collection.
//!
//! ```
//! use serde_json::json;
//! use store::{DocumentStore, InMemoryStore, Pipeline, Stage, document};
//!
//! let store = InMemoryStore::new();
//! store
//!     .insert_many("movies", vec![document(json!({ "title": "X", "year": 1999 }))])
//!     .unwrap();
//!
//! let pipeline = Pipeline::new()
//!     .stage(Stage::Range { field: "copy".into(), start: 0, end: 3 })
//!     .stage(Stage::Unwind { field: "copy".into() })
//!     .stage(Stage::Unset { field: "_id".into() })
//!     .stage(Stage::Out { collection: "copies".into() });
//! store.aggregate("movies", &pipeline).unwrap();
//!
//! assert_eq!(store.count("copies").unwrap(), 3);
//! ```

mod backend;
pub mod pipeline;

pub use backend::{DocumentStore, InMemoryStore, StoreConfig};
#[cfg(feature = "backend-mongo")]
pub use backend::MongoStore;
#[cfg(feature = "backend-redb")]
pub use backend::RedbStore;
pub use pipeline::{Noise, Pipeline, Projection, Stage};

use serde_json::{Map, Value};
use thiserror::Error;

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Field holding the store-assigned document identifier.
pub const ID_FIELD: &str = "_id";

/// Errors raised by stores and pipeline evaluation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Duplicate _id {id} in collection {collection}")]
    DuplicateId { collection: String, id: String },
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl StoreError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Unwraps a JSON object into a [`Document`]; any other value becomes an
/// empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Returns the key under which a document is stored: the JSON text of its
/// identifier, so `1` and `"1"` stay distinct.
pub(crate) fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Gives the document a fresh identifier when it has none and returns its key.
pub(crate) fn ensure_id(doc: &mut Document) -> String {
    let id = doc
        .entry(ID_FIELD)
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    id_key(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_id_keeps_existing_identifier() {
        let mut doc = document(json!({ "_id": 7, "title": "X" }));
        assert_eq!(ensure_id(&mut doc), "7");
        assert_eq!(ensure_id(&mut document(json!({ "_id": "a" }))), "\"a\"");
        assert_eq!(doc[ID_FIELD], json!(7));
    }

    #[test]
    fn ensure_id_assigns_fresh_identifiers() {
        let mut a = document(json!({ "title": "X" }));
        let mut b = a.clone();
        let key_a = ensure_id(&mut a);
        let key_b = ensure_id(&mut b);
        assert_ne!(key_a, key_b);
        assert!(a.contains_key(ID_FIELD));
    }

    #[test]
    fn id_key_distinguishes_numbers_from_strings() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
    }

    #[test]
    fn document_of_non_object_is_empty() {
        assert!(document(json!([1, 2, 3])).is_empty());
    }
}
