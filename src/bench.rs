//! Aggregation speed test.
//!
//! Runs one pipeline many times across a fixed pool of threads and reports
//! throughput. A `match` stage whose value is the string `<<VALUE>>` is a
//! placeholder: before each call it is filled with a key picked at random
//! from the values fetched by [`QueryValues`], so calls do not all hit the
//! same document.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use store::{DocumentStore, Pipeline, Stage};
use tracing::{Level, info, warn};

use crate::PrepError;

/// Marker value substituted with a fetched key on every call.
pub const PLACEHOLDER: &str = "<<VALUE>>";

const PROGRESS_EVERY: usize = 1000;

/// Where the placeholder keys come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryValues {
    pub collection: String,
    #[serde(default)]
    pub pipeline: Pipeline,
    /// Field read from every row the pipeline returns.
    pub field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    pub collection: String,
    pub pipeline: Pipeline,
    pub threads: usize,
    /// Total calls, divided evenly between threads.
    pub calls: usize,
    pub query_values: Option<QueryValues>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub calls: usize,
    pub failures: usize,
    pub elapsed: Duration,
    pub ops_per_sec: f64,
}

/// Runs the query-values pipeline and collects `field` from each row.
/// Rows without the field are skipped.
pub fn fetch_keys(
    store: &dyn DocumentStore,
    values: &QueryValues,
) -> Result<Vec<Value>, PrepError> {
    let rows = store.aggregate(&values.collection, &values.pipeline)?;
    let keys: Vec<Value> = rows
        .into_iter()
        .filter_map(|mut row| row.remove(&values.field))
        .collect();
    info!(keys = keys.len(), collection = %values.collection, "bench_keys_fetched");
    Ok(keys)
}

/// Position of the first `match` stage holding the placeholder.
pub fn placeholder_stage(pipeline: &Pipeline) -> Option<usize> {
    pipeline.stages().iter().position(|stage| {
        matches!(stage, Stage::Match { value: Value::String(v), .. } if v == PLACEHOLDER)
    })
}

pub fn run(store: &dyn DocumentStore, cfg: &BenchConfig) -> Result<BenchReport, PrepError> {
    if cfg.threads == 0 {
        return Err(PrepError::Bench("threads must be >= 1".to_string()));
    }
    let span = tracing::span!(
        Level::INFO,
        "bench.run",
        collection = %cfg.collection,
        threads = cfg.threads,
        calls = cfg.calls
    );
    let _guard = span.enter();

    let keys = match &cfg.query_values {
        Some(values) => fetch_keys(store, values)?,
        None => Vec::new(),
    };
    let slot = placeholder_stage(&cfg.pipeline);
    if slot.is_some() && keys.is_empty() {
        return Err(PrepError::Bench(format!(
            "pipeline uses {PLACEHOLDER} but no query values were fetched"
        )));
    }

    let calls_per_thread = cfg.calls / cfg.threads;
    let failures = AtomicUsize::new(0);
    info!(calls_per_thread, "bench_start");

    let start = Instant::now();
    thread::scope(|scope| {
        for worker in 0..cfg.threads {
            let worker_keys = &keys;
            let failures = &failures;
            scope.spawn(move || {
                let task = Worker {
                    store,
                    cfg,
                    slot,
                    keys: worker_keys,
                    calls: calls_per_thread,
                    report: worker == 0,
                };
                failures.fetch_add(task.run(), Ordering::Relaxed);
            });
        }
    });
    let elapsed = start.elapsed();

    let calls = calls_per_thread * cfg.threads;
    let ops_per_sec = calls as f64 / elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let failures = failures.into_inner();
    info!(
        calls,
        failures,
        elapsed_millis = elapsed.as_millis(),
        ops_per_sec,
        "bench_complete"
    );
    Ok(BenchReport {
        calls,
        failures,
        elapsed,
        ops_per_sec,
    })
}

struct Worker<'a> {
    store: &'a dyn DocumentStore,
    cfg: &'a BenchConfig,
    slot: Option<usize>,
    keys: &'a [Value],
    calls: usize,
    report: bool,
}

impl Worker<'_> {
    /// Returns the number of failed calls. Failures are logged and the loop
    /// carries on.
    fn run(&self) -> usize {
        // Each thread mutates its own copy of the pipeline.
        let mut pipeline = self.cfg.pipeline.clone();
        let mut rng = rand::thread_rng();
        let mut failures = 0;

        for call in 0..self.calls {
            if let Some(index) = self.slot {
                if let (Some(key), Stage::Match { value, .. }) =
                    (self.keys.choose(&mut rng), &mut pipeline.stages_mut()[index])
                {
                    *value = key.clone();
                }
            }
            if let Err(err) = self.store.aggregate(&self.cfg.collection, &pipeline) {
                failures += 1;
                warn!(error = %err, call, "bench_call_failure");
            }
            if self.report && call % PROGRESS_EVERY == 0 {
                info!(call, calls = self.calls, "bench_progress");
            }
        }
        failures
    }
}
