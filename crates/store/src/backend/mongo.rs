//! MongoDB backend.
//!
//! Pipelines are translated stage by stage into native aggregation stages and
//! executed by the server, so the perturbation draws come from `$rand` and
//! `$out` performs the overwrite. Documents cross the boundary as relaxed
//! extended JSON; the server assigns `ObjectId`s to documents without `_id`.

use crate::pipeline::{Pipeline, Projection, Stage};
use crate::{document, Document, DocumentStore, StoreError};
use mongodb::bson::{self, doc, Bson, Document as BsonDocument};
use mongodb::sync::{Client, Collection, Database};

/// A MongoDB database reached through the synchronous driver.
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Connects to `uri` and selects `database`.
    pub fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).map_err(StoreError::backend)?;
        Ok(Self {
            database: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection::<BsonDocument>(name)
    }
}

fn to_bson_document(doc: &Document) -> Result<BsonDocument, StoreError> {
    bson::to_document(doc).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_bson_document(doc: BsonDocument) -> Document {
    document(Bson::Document(doc).into_relaxed_extjson())
}

fn single(key: &str, value: impl Into<Bson>) -> BsonDocument {
    let mut doc = BsonDocument::new();
    doc.insert(key, value);
    doc
}

/// Translates one stage into its MongoDB aggregation form.
pub fn stage_to_bson(stage: &Stage) -> Result<BsonDocument, StoreError> {
    let translated = match stage {
        Stage::Range { field, start, end } => {
            let (start, end) = (*start, *end);
            let range = doc! { "$range": [start, end] };
            doc! { "$set": single(field, range) }
        }
        Stage::Unwind { field } => {
            let path = format!("${field}");
            doc! { "$unwind": path }
        }
        Stage::Unset { field } => {
            let field = field.clone();
            doc! { "$unset": field }
        }
        Stage::Perturb {
            field,
            copy_field,
            keep_copy,
            noise,
        } => {
            let path = format!("${field}");
            let copy_path = format!("${copy_field}");
            let (scale, offset, keep) = (noise.scale, noise.offset, *keep_copy);
            let draw = doc! { "$add": [{ "$multiply": [{ "$rand": {} }, scale] }, offset] };
            let shifted = doc! {
                "$map": { "input": path.clone(), "in": { "$add": ["$$this", draw] } }
            };
            let choice = doc! {
                "$cond": { "if": { "$eq": [copy_path, keep] }, "then": path, "else": shifted }
            };
            doc! { "$set": single(field, choice) }
        }
        Stage::Match { field, value } => {
            let value =
                bson::to_bson(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
            doc! { "$match": single(field, value) }
        }
        Stage::Limit { count } => {
            let count = *count as i64;
            doc! { "$limit": count }
        }
        Stage::Project { field, mode } => {
            let flag = match mode {
                Projection::Include => 1,
                Projection::Exclude => 0,
            };
            doc! { "$project": single(field, flag) }
        }
        Stage::Out { collection } => {
            let collection = collection.clone();
            doc! { "$out": collection }
        }
    };
    Ok(translated)
}

/// Translates a whole pipeline.
pub fn pipeline_to_bson(pipeline: &Pipeline) -> Result<Vec<BsonDocument>, StoreError> {
    pipeline.stages().iter().map(stage_to_bson).collect()
}

impl DocumentStore for MongoStore {
    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }
        let docs = docs
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.collection(collection)
            .insert_many(docs, None)
            .map_err(StoreError::backend)?;
        Ok(())
    }

    // Not atomic: a failure after the drop leaves the collection partially
    // written. `aggregate` with `$out` is the atomic path.
    fn replace(&self, collection: &str, docs: Vec<Document>) -> Result<(), StoreError> {
        self.drop_collection(collection)?;
        self.insert_many(collection, docs)
    }

    fn scan(
        &self,
        collection: &str,
        visitor: &mut dyn FnMut(Document) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let cursor = self
            .collection(collection)
            .find(None, None)
            .map_err(StoreError::backend)?;
        for result in cursor {
            visitor(from_bson_document(result.map_err(StoreError::backend)?))?;
        }
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let count = self
            .collection(collection)
            .count_documents(None, None)
            .map_err(StoreError::backend)?;
        Ok(count as usize)
    }

    fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.collection(collection)
            .drop(None)
            .map_err(StoreError::backend)
    }

    fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self
            .database
            .list_collection_names(None)
            .map_err(StoreError::backend)?;
        names.sort();
        Ok(names)
    }

    fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> Result<Vec<Document>, StoreError> {
        pipeline.validate()?;
        let stages = pipeline_to_bson(pipeline)?;
        let cursor = self
            .collection(collection)
            .aggregate(stages, None)
            .map_err(StoreError::backend)?;
        let mut rows = Vec::new();
        for result in cursor {
            rows.push(from_bson_document(result.map_err(StoreError::backend)?));
        }
        Ok(rows)
    }
}
