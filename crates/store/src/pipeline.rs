//! Typed aggregation pipelines and their in-process evaluator.
//!
//! Stages follow MongoDB semantics closely enough that a pipeline evaluated
//! here and the same pipeline translated for a MongoDB server produce the same
//! shape of output:
//!
//! | Stage | MongoDB equivalent |
//! |-------|--------------------|
//! | [`Stage::Range`] | `{ $set: { f: { $range: [start, end] } } }` |
//! | [`Stage::Unwind`] | `{ $unwind: "$f" }` |
//! | [`Stage::Unset`] | `{ $unset: "f" }` |
//! | [`Stage::Perturb`] | `{ $set: { f: { $cond: ... $map ... $rand } } }` |
//! | [`Stage::Match`] | `{ $match: { f: value } }` |
//! | [`Stage::Limit`] | `{ $limit: n }` |
//! | [`Stage::Project`] | `{ $project: { f: 1 } }` / `{ $project: { f: 0 } }` |
//! | [`Stage::Out`] | `{ $out: "collection" }` |
//!
//! Pipelines deserialize from a `stage`-tagged representation so they can be
//! written in configuration files:
//!
//! ```
//! use store::{Pipeline, Stage};
//!
//! let pipeline: Pipeline = serde_json::from_str(
//!     r#"[
//!         { "stage": "match", "field": "title", "value": "X" },
//!         { "stage": "limit", "count": 1 }
//!     ]"#,
//! )
//! .unwrap();
//! assert_eq!(pipeline.stages().len(), 2);
//! assert!(matches!(pipeline.stages()[1], Stage::Limit { count: 1 }));
//! ```

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::debug;

use crate::{Document, StoreError, ID_FIELD};

/// Uniform noise `uniform[0, 1) * scale + offset`, i.e. a draw from
/// `[offset, offset + scale)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Noise {
    pub scale: f64,
    pub offset: f64,
}

impl Noise {
    pub const fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    /// Noise of the given width centered on zero.
    pub fn centered(width: f64) -> Self {
        Self::new(width, -width / 2.0)
    }

    /// Half-open range `[low, high)` of the values [`Noise::sample`] returns.
    pub fn bounds(&self) -> (f64, f64) {
        (self.offset, self.offset + self.scale)
    }

    /// Draws one fresh value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        rng.gen::<f64>() * self.scale + self.offset
    }
}

/// Whether a projection keeps or drops its field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// Keep only the field (and the document identifier).
    Include,
    /// Keep everything except the field.
    Exclude,
}

/// One pipeline stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    /// Sets `field` to the integers `start..end`.
    Range { field: String, start: i64, end: i64 },
    /// Emits one row per element of the array in `field`. Missing, null and
    /// empty arrays drop the row; scalars pass through unchanged.
    Unwind { field: String },
    /// Removes `field`.
    Unset { field: String },
    /// Shifts every component of the vector in `field` by a fresh noise draw,
    /// except on rows whose `copy_field` equals `keep_copy`.
    Perturb {
        field: String,
        copy_field: String,
        #[serde(default)]
        keep_copy: i64,
        noise: Noise,
    },
    /// Keeps rows whose top-level `field` equals `value`.
    Match { field: String, value: Value },
    /// Keeps the first `count` rows.
    Limit { count: usize },
    /// Keeps or drops a single field.
    Project { field: String, mode: Projection },
    /// Overwrites `collection` with the result. Only valid as the last stage.
    Out { collection: String },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Range { .. } => "range",
            Stage::Unwind { .. } => "unwind",
            Stage::Unset { .. } => "unset",
            Stage::Perturb { .. } => "perturb",
            Stage::Match { .. } => "match",
            Stage::Limit { .. } => "limit",
            Stage::Project { .. } => "project",
            Stage::Out { .. } => "out",
        }
    }
}

/// An ordered list of stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    /// The collection a trailing [`Stage::Out`] writes to.
    pub fn output(&self) -> Option<&str> {
        match self.stages.last() {
            Some(Stage::Out { collection }) => Some(collection.as_str()),
            _ => None,
        }
    }

    /// Every stage except a trailing [`Stage::Out`].
    pub fn transforms(&self) -> &[Stage] {
        match self.stages.split_last() {
            Some((Stage::Out { .. }, rest)) => rest,
            _ => &self.stages,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let last = self.stages.len().saturating_sub(1);
        for (position, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Out { collection } => {
                    if position != last {
                        return Err(StoreError::InvalidPipeline(
                            "out must be the last stage".to_string(),
                        ));
                    }
                    if collection.is_empty() {
                        return Err(StoreError::InvalidPipeline(
                            "out requires a collection name".to_string(),
                        ));
                    }
                }
                Stage::Limit { count: 0 } => {
                    return Err(StoreError::InvalidPipeline(
                        "limit must be positive".to_string(),
                    ));
                }
                Stage::Perturb { noise, .. } => {
                    if !noise.scale.is_finite() || !noise.offset.is_finite() {
                        return Err(StoreError::InvalidPipeline(
                            "perturb noise must be finite".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Runs `stages` over `docs`. A [`Stage::Out`] here is an error: writing is
/// the store's job.
pub fn evaluate(mut docs: Vec<Document>, stages: &[Stage]) -> Result<Vec<Document>, StoreError> {
    for stage in stages {
        let rows_in = docs.len();
        docs = apply(docs, stage)?;
        debug!(
            stage = stage.name(),
            rows_in,
            rows_out = docs.len(),
            "pipeline_stage"
        );
    }
    Ok(docs)
}

fn apply(mut docs: Vec<Document>, stage: &Stage) -> Result<Vec<Document>, StoreError> {
    match stage {
        Stage::Range { field, start, end } => {
            let values: Vec<Value> = (*start..*end).map(Value::from).collect();
            for doc in &mut docs {
                doc.insert(field.clone(), Value::Array(values.clone()));
            }
            Ok(docs)
        }
        Stage::Unwind { field } => Ok(unwind(docs, field)),
        Stage::Unset { field } => {
            for doc in &mut docs {
                doc.remove(field);
            }
            Ok(docs)
        }
        Stage::Perturb {
            field,
            copy_field,
            keep_copy,
            noise,
        } => {
            let keep = *keep_copy as f64;
            docs.par_iter_mut()
                .for_each_init(rand::thread_rng, |rng, doc| {
                    if doc.get(copy_field).and_then(Value::as_f64) == Some(keep) {
                        return;
                    }
                    let perturbed =
                        perturb_vector(doc.get(field).unwrap_or(&Value::Null), noise, rng);
                    doc.insert(field.clone(), perturbed);
                });
            Ok(docs)
        }
        Stage::Match { field, value } => {
            docs.retain(|doc| matches_value(doc.get(field), value));
            Ok(docs)
        }
        Stage::Limit { count } => {
            docs.truncate(*count);
            Ok(docs)
        }
        Stage::Project { field, mode } => {
            for doc in &mut docs {
                match mode {
                    Projection::Include => {
                        doc.retain(|key, _| key == field || key == ID_FIELD);
                    }
                    Projection::Exclude => {
                        doc.remove(field);
                    }
                }
            }
            Ok(docs)
        }
        Stage::Out { .. } => Err(StoreError::InvalidPipeline(
            "out cannot be evaluated in place".to_string(),
        )),
    }
}

fn unwind(docs: Vec<Document>, field: &str) -> Vec<Document> {
    let mut rows = Vec::with_capacity(docs.len());
    for mut doc in docs {
        match doc.remove(field) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut row = doc.clone();
                    row.insert(field.to_string(), item);
                    rows.push(row);
                }
            }
            None | Some(Value::Null) => {}
            Some(scalar) => {
                doc.insert(field.to_string(), scalar);
                rows.push(doc);
            }
        }
    }
    rows
}

/// Adds a fresh noise draw to every component of `vector`.
///
/// A non-array input yields `null`, and so does any non-numeric component.
pub fn perturb_vector<R: Rng + ?Sized>(vector: &Value, noise: &Noise, rng: &mut R) -> Value {
    match vector {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item.as_f64() {
                    Some(x) => Number::from_f64(x + noise.sample(rng))
                        .map_or(Value::Null, Value::Number),
                    None => Value::Null,
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

// Numbers compare by value so 1 matches 1.0; a null filter also matches a
// missing field.
fn matches_value(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use serde_json::json;

    fn movie() -> Document {
        document(json!({ "_id": 1, "title": "X", "plot_embedding": [1.0, 2.0, 3.0] }))
    }

    #[test]
    fn range_then_unwind_expands_each_document() {
        let rows = evaluate(
            vec![movie(), movie()],
            &[
                Stage::Range {
                    field: "copy".into(),
                    start: 0,
                    end: 4,
                },
                Stage::Unwind {
                    field: "copy".into(),
                },
            ],
        )
        .unwrap();

        assert_eq!(rows.len(), 8);
        let mut copies: Vec<i64> = rows.iter().map(|r| r["copy"].as_i64().unwrap()).collect();
        copies.sort_unstable();
        assert_eq!(copies, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn unwind_drops_missing_and_empty_arrays() {
        let docs = vec![
            document(json!({ "tags": [] })),
            document(json!({ "other": 1 })),
            document(json!({ "tags": null })),
            document(json!({ "tags": "solo" })),
        ];
        let rows = evaluate(docs, &[Stage::Unwind { field: "tags".into() }]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["tags"], json!("solo"));
    }

    #[test]
    fn empty_range_drops_rows_after_unwind() {
        let rows = evaluate(
            vec![movie()],
            &[
                Stage::Range {
                    field: "copy".into(),
                    start: 0,
                    end: 0,
                },
                Stage::Unwind {
                    field: "copy".into(),
                },
            ],
        )
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn perturb_skips_the_kept_copy() {
        let mut kept = movie();
        kept.insert("copy".into(), json!(0));
        let mut varied = movie();
        varied.insert("copy".into(), json!(1));

        let rows = evaluate(
            vec![kept, varied],
            &[Stage::Perturb {
                field: "plot_embedding".into(),
                copy_field: "copy".into(),
                keep_copy: 0,
                noise: Noise::centered(1e-7),
            }],
        )
        .unwrap();

        assert_eq!(rows[0]["plot_embedding"], json!([1.0, 2.0, 3.0]));
        let varied: Vec<f64> = rows[1]["plot_embedding"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        for (value, original) in varied.iter().zip([1.0, 2.0, 3.0]) {
            assert!((value - original).abs() <= 5e-8 + f64::EPSILON * 4.0);
        }
    }

    #[test]
    fn noise_samples_stay_in_bounds() {
        let noise = Noise::centered(1e-7);
        let (low, high) = noise.bounds();
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let draw = noise.sample(&mut rng);
            assert!(draw >= low && draw < high, "draw {draw} outside [{low}, {high})");
        }
    }

    #[test]
    fn perturb_vector_draws_per_component() {
        let zeros = Value::Array(vec![json!(0.0); 64]);
        let mut rng = rand::thread_rng();
        let perturbed = perturb_vector(&zeros, &Noise::centered(1e-7), &mut rng);
        let mut values: Vec<f64> = perturbed
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        values.sort_by(f64::total_cmp);
        values.dedup();
        assert!(values.len() > 60, "components share noise draws");
    }

    #[test]
    fn perturb_vector_nulls_bad_input() {
        let mut rng = rand::thread_rng();
        let noise = Noise::centered(1e-7);
        assert_eq!(perturb_vector(&Value::Null, &noise, &mut rng), Value::Null);
        assert_eq!(perturb_vector(&json!("x"), &noise, &mut rng), Value::Null);
        let mixed = perturb_vector(&json!([1.0, "a"]), &noise, &mut rng);
        assert_eq!(mixed[1], Value::Null);
        assert!(mixed[0].is_number());
    }

    #[test]
    fn project_include_keeps_identifier() {
        let rows = evaluate(
            vec![movie()],
            &[Stage::Project {
                field: "plot_embedding".into(),
                mode: Projection::Include,
            }],
        )
        .unwrap();
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["_id", "plot_embedding"]);
    }

    #[test]
    fn project_exclude_drops_field() {
        let rows = evaluate(
            vec![movie()],
            &[Stage::Project {
                field: "plot_embedding".into(),
                mode: Projection::Exclude,
            }],
        )
        .unwrap();
        assert!(!rows[0].contains_key("plot_embedding"));
        assert_eq!(rows[0]["title"], json!("X"));
    }

    #[test]
    fn match_compares_numbers_by_value() {
        let docs = vec![
            document(json!({ "year": 1999 })),
            document(json!({ "year": 1999.0 })),
            document(json!({ "year": 2000 })),
        ];
        let rows = evaluate(
            docs,
            &[Stage::Match {
                field: "year".into(),
                value: json!(1999),
            }],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn validate_rejects_out_before_end() {
        let pipeline = Pipeline::new()
            .stage(Stage::Out {
                collection: "a".into(),
            })
            .stage(Stage::Limit { count: 1 });
        assert!(matches!(
            pipeline.validate(),
            Err(StoreError::InvalidPipeline(_))
        ));
    }

    #[test]
    fn output_and_transforms_split_trailing_out() {
        let pipeline = Pipeline::new()
            .stage(Stage::Limit { count: 1 })
            .stage(Stage::Out {
                collection: "target".into(),
            });
        assert_eq!(pipeline.output(), Some("target"));
        assert_eq!(pipeline.transforms().len(), 1);
        assert!(Pipeline::new().output().is_none());
    }

    #[test]
    fn stages_deserialize_from_tagged_form() {
        let stage: Stage = serde_json::from_value(json!({
            "stage": "perturb",
            "field": "plot_embedding",
            "copy_field": "copy",
            "noise": { "scale": 1e-7, "offset": -5e-8 }
        }))
        .unwrap();
        assert_eq!(
            stage,
            Stage::Perturb {
                field: "plot_embedding".into(),
                copy_field: "copy".into(),
                keep_copy: 0,
                noise: Noise::new(1e-7, -5e-8),
            }
        );
    }
}
