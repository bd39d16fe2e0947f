//! Splits the fanned-out collection into a vectors-only and a metadata-only
//! collection. Both keep the store identifier, so a row in one joins back to
//! its row in the other.

use std::time::{Duration, Instant};

use store::{DocumentStore, Pipeline, Projection, Stage};
use tracing::{Level, info, warn};

use crate::PrepError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitConfig {
    pub source_collection: String,
    pub vector_field: String,
    pub vectors_collection: String,
    pub metadata_collection: String,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            source_collection: "movies_with_embed".to_string(),
            vector_field: "plot_embedding".to_string(),
            vectors_collection: "embeddings_only".to_string(),
            metadata_collection: "movies_only".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    pub vectors_rows: usize,
    pub metadata_rows: usize,
    pub elapsed: Duration,
}

pub fn vectors_pipeline(cfg: &SplitConfig) -> Pipeline {
    projection(cfg, Projection::Include, &cfg.vectors_collection)
}

pub fn metadata_pipeline(cfg: &SplitConfig) -> Pipeline {
    projection(cfg, Projection::Exclude, &cfg.metadata_collection)
}

fn projection(cfg: &SplitConfig, mode: Projection, target: &str) -> Pipeline {
    Pipeline::new()
        .stage(Stage::Project {
            field: cfg.vector_field.clone(),
            mode,
        })
        .stage(Stage::Out {
            collection: target.to_string(),
        })
}

/// Writes both projections, vectors first. Each overwrites its target.
pub fn run(store: &dyn DocumentStore, cfg: &SplitConfig) -> Result<SplitReport, PrepError> {
    let start = Instant::now();
    let span = tracing::span!(
        Level::INFO,
        "split.run",
        source = %cfg.source_collection
    );
    let _guard = span.enter();

    let result = run_inner(store, cfg);

    match result {
        Ok((vectors_rows, metadata_rows)) => {
            let elapsed = start.elapsed();
            info!(elapsed_micros = elapsed.as_micros(), "split_success");
            Ok(SplitReport {
                vectors_rows,
                metadata_rows,
                elapsed,
            })
        }
        Err(err) => {
            warn!(
                error = %err,
                elapsed_micros = start.elapsed().as_micros(),
                "split_failure"
            );
            Err(err)
        }
    }
}

fn run_inner(store: &dyn DocumentStore, cfg: &SplitConfig) -> Result<(usize, usize), PrepError> {
    store.aggregate(&cfg.source_collection, &vectors_pipeline(cfg))?;
    let vectors_rows = store.count(&cfg.vectors_collection)?;
    info!(collection = %cfg.vectors_collection, rows = vectors_rows, "split_vectors_written");

    store.aggregate(&cfg.source_collection, &metadata_pipeline(cfg))?;
    let metadata_rows = store.count(&cfg.metadata_collection)?;
    info!(collection = %cfg.metadata_collection, rows = metadata_rows, "split_metadata_written");

    Ok((vectors_rows, metadata_rows))
}
