//! Duplication and perturbation of an embedded collection.
//!
//! Every source document becomes `copies` rows. Copy `0` keeps its vector
//! exactly; every other copy gets each vector component shifted by its own
//! noise draw, so the copies are near-duplicates that still differ as vectors.
//! The original `_id` is dropped so the store can give each row a fresh one.

use std::time::{Duration, Instant};

use store::{DocumentStore, ID_FIELD, Noise, Pipeline, Stage};
use tracing::{Level, info, warn};

use crate::PrepError;

/// Copy index left unperturbed.
pub const CANONICAL_COPY: i64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct FanoutConfig {
    pub source_collection: String,
    pub output_collection: String,
    pub vector_field: String,
    /// Transient field carrying the copy index; removed before writing.
    pub copy_field: String,
    pub copies: u32,
    pub noise: Noise,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            source_collection: "embedded_movies".to_string(),
            output_collection: "movies_with_embed".to_string(),
            vector_field: "plot_embedding".to_string(),
            copy_field: "copy".to_string(),
            copies: 172,
            noise: Noise::new(0.0000001, -0.00000005),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub source_rows: usize,
    pub output_rows: usize,
    pub elapsed: Duration,
}

/// Builds the fanout pipeline: expand, drop `_id`, perturb, drop the copy
/// index, write.
pub fn pipeline(cfg: &FanoutConfig) -> Pipeline {
    Pipeline::new()
        .stage(Stage::Range {
            field: cfg.copy_field.clone(),
            start: 0,
            end: i64::from(cfg.copies),
        })
        .stage(Stage::Unwind {
            field: cfg.copy_field.clone(),
        })
        .stage(Stage::Unset {
            field: ID_FIELD.to_string(),
        })
        .stage(Stage::Perturb {
            field: cfg.vector_field.clone(),
            copy_field: cfg.copy_field.clone(),
            keep_copy: CANONICAL_COPY,
            noise: cfg.noise,
        })
        .stage(Stage::Unset {
            field: cfg.copy_field.clone(),
        })
        .stage(Stage::Out {
            collection: cfg.output_collection.clone(),
        })
}

/// Runs the fanout against `store`, overwriting the output collection.
pub fn run(store: &dyn DocumentStore, cfg: &FanoutConfig) -> Result<FanoutReport, PrepError> {
    let start = Instant::now();
    let span = tracing::span!(
        Level::INFO,
        "fanout.run",
        source = %cfg.source_collection,
        output = %cfg.output_collection,
        copies = cfg.copies
    );
    let _guard = span.enter();

    match run_inner(store, cfg) {
        Ok((source_rows, output_rows)) => {
            let elapsed = start.elapsed();
            info!(
                source_rows,
                output_rows,
                elapsed_micros = elapsed.as_micros(),
                "fanout_success"
            );
            Ok(FanoutReport {
                source_rows,
                output_rows,
                elapsed,
            })
        }
        Err(err) => {
            warn!(
                error = %err,
                elapsed_micros = start.elapsed().as_micros(),
                "fanout_failure"
            );
            Err(err)
        }
    }
}

fn run_inner(store: &dyn DocumentStore, cfg: &FanoutConfig) -> Result<(usize, usize), PrepError> {
    let source_rows = store.count(&cfg.source_collection)?;
    if source_rows == 0 {
        warn!(collection = %cfg.source_collection, "fanout_source_empty");
    }
    store.aggregate(&cfg.source_collection, &pipeline(cfg))?;
    let output_rows = store.count(&cfg.output_collection)?;
    Ok((source_rows, output_rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_expands_before_perturbing() {
        let stages = pipeline(&FanoutConfig::default());
        let names: Vec<&str> = stages.stages().iter().map(Stage::name).collect();
        assert_eq!(
            names,
            vec!["range", "unwind", "unset", "perturb", "unset", "out"]
        );
        assert_eq!(stages.output(), Some("movies_with_embed"));
        assert!(stages.validate().is_ok());
    }

    #[test]
    fn pipeline_range_covers_every_copy() {
        let cfg = FanoutConfig {
            copies: 3,
            ..Default::default()
        };
        assert!(matches!(
            pipeline(&cfg).stages()[0],
            Stage::Range { start: 0, end: 3, .. }
        ));
    }

    #[test]
    fn default_noise_is_centered_on_zero() {
        let (low, high) = FanoutConfig::default().noise.bounds();
        assert_eq!(low, -0.00000005);
        assert!((high - 0.00000005).abs() < 1e-20);
    }
}
