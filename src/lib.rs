//! embedfan: fan a vector-embedded document collection out into perturbed
//! near-duplicates, then split it into vectors-only and metadata-only
//! collections.
//!
//! The work is three pipelines run one after the other against a
//! [`DocumentStore`]:
//!
//! 1. [`fanout`]: every source document becomes `copies` rows. Copy 0 is
//!    kept as is; the others have each vector component shifted by a fresh
//!    draw from `[-0.00000005, 0.00000005)`. The result overwrites the output
//!    collection.
//! 2. [`split`] (vectors): the output projected down to the vector field.
//! 3. [`split`] (metadata): the output without the vector field.
//!
//! [`prepare`] runs all three. Any error aborts the remaining steps; nothing
//! is retried.
//!
//! ```
//! use embedfan::{FanoutConfig, SplitConfig, prepare};
//! use serde_json::json;
//! use store::{DocumentStore, InMemoryStore, document};
//!
//! let store = InMemoryStore::new();
//! store
//!     .insert_many(
//!         "embedded_movies",
//!         vec![document(json!({ "_id": 1, "title": "X", "plot_embedding": [1.0, 2.0, 3.0] }))],
//!     )
//!     .unwrap();
//!
//! let fanout = FanoutConfig { copies: 2, ..Default::default() };
//! let report = prepare(&store, &fanout, &SplitConfig::default()).unwrap();
//! assert_eq!(report.fanout.output_rows, 2);
//! assert_eq!(store.count("embeddings_only").unwrap(), 2);
//! ```

pub mod bench;
pub mod config;
pub mod fanout;
pub mod io;
pub mod split;

pub use crate::bench::{BenchConfig, BenchReport, QueryValues};
pub use crate::config::{ConfigLoadError, EmbedfanConfig};
pub use crate::fanout::{FanoutConfig, FanoutReport};
pub use crate::split::{SplitConfig, SplitReport};
pub use store::{Document, DocumentStore, StoreConfig, StoreError};

use thiserror::Error;
use tracing::info;

/// Errors that can occur while preparing a collection.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("configuration failure: {0}")]
    Config(#[from] ConfigLoadError),
    #[error("invalid input at line {line}: {message}")]
    Import { line: usize, message: String },
    #[error("bench failure: {0}")]
    Bench(String),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepReport {
    pub fanout: FanoutReport,
    pub split: SplitReport,
}

/// Runs the fanout, then both projections.
pub fn prepare(
    store: &dyn DocumentStore,
    fanout_cfg: &FanoutConfig,
    split_cfg: &SplitConfig,
) -> Result<PrepReport, PrepError> {
    let fanout = fanout::run(store, fanout_cfg)?;
    let split = split::run(store, split_cfg)?;
    info!(
        source_rows = fanout.source_rows,
        output_rows = fanout.output_rows,
        vectors_rows = split.vectors_rows,
        metadata_rows = split.metadata_rows,
        "prepare_complete"
    );
    Ok(PrepReport { fanout, split })
}
