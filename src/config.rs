//! YAML configuration for embedfan.
//!
//! Every field has a default, so an empty file (or no file at all) runs the
//! standard `sample_mflix` preparation against the redb file `embedfan.redb`:
//! 172 copies of `embedded_movies` into `movies_with_embed`, split into
//! `embeddings_only` and `movies_only`.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//!
//! store:
//!   backend: "mongo"
//!   uri: "mongodb://localhost:27017"
//!   database: "sample_mflix"
//!
//! fanout:
//!   source_collection: "embedded_movies"
//!   output_collection: "movies_with_embed"
//!   vector_field: "plot_embedding"
//!   copies: 172
//!   noise_scale: 0.0000001
//!   noise_offset: -0.00000005
//!
//! split:
//!   vectors_collection: "embeddings_only"
//!   metadata_collection: "movies_only"
//!
//! bench:
//!   collection: "movies_only"
//!   threads: 8
//!   calls: 10000
//!   pipeline:
//!     - { stage: "match", field: "title", value: "<<VALUE>>" }
//!   query_values:
//!     collection: "movies_only"
//!     field: "title"
//!     pipeline:
//!       - { stage: "limit", count: 1000 }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use store::{Noise, Pipeline, StoreConfig};
use thiserror::Error;

use crate::bench::{BenchConfig, QueryValues};
use crate::fanout::FanoutConfig;
use crate::split::SplitConfig;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),

    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedfanConfig {
    #[serde(default = "default_config_version")]
    pub version: String,

    #[serde(default)]
    pub store: StoreYamlConfig,

    #[serde(default)]
    pub fanout: FanoutYamlConfig,

    #[serde(default)]
    pub split: SplitYamlConfig,

    /// Aggregation speed test; only needed by the `bench` command.
    #[serde(default)]
    pub bench: Option<BenchYamlConfig>,
}

impl EmbedfanConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        // serde_yaml turns an empty document into a unit, not a map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EmbedfanConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.store.validate()?;
        self.fanout.validate()?;
        self.split.validate()?;
        if let Some(bench) = &self.bench {
            bench.validate()?;
        }
        Ok(())
    }

    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            source_collection: self.fanout.source_collection.clone(),
            output_collection: self.fanout.output_collection.clone(),
            vector_field: self.fanout.vector_field.clone(),
            copy_field: self.fanout.copy_field.clone(),
            copies: self.fanout.copies,
            noise: Noise::new(self.fanout.noise_scale, self.fanout.noise_offset),
        }
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            source_collection: self.fanout.output_collection.clone(),
            vector_field: self.fanout.vector_field.clone(),
            vectors_collection: self.split.vectors_collection.clone(),
            metadata_collection: self.split.metadata_collection.clone(),
        }
    }

    pub fn bench_config(&self) -> Result<BenchConfig, ConfigLoadError> {
        let bench = self
            .bench
            .as_ref()
            .ok_or_else(|| ConfigLoadError::MissingField("bench".to_string()))?;
        Ok(BenchConfig {
            collection: bench.collection.clone(),
            pipeline: bench.pipeline.clone(),
            threads: bench.threads,
            calls: bench.calls,
            query_values: bench.query_values.clone(),
        })
    }
}

impl Default for EmbedfanConfig {
    fn default() -> Self {
        Self {
            version: default_config_version(),
            store: StoreYamlConfig::default(),
            fanout: FanoutYamlConfig::default(),
            split: SplitYamlConfig::default(),
            bench: None,
        }
    }
}

/// Store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreYamlConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    /// redb file path
    #[serde(default = "default_store_path")]
    pub path: Option<String>,

    /// MongoDB connection string
    #[serde(default)]
    pub uri: Option<String>,

    #[serde(default = "default_database")]
    pub database: String,
}

impl StoreYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        let valid_backends = ["in_memory", "redb", "mongo"];
        if !valid_backends.contains(&self.backend.as_str()) {
            return Err(ConfigLoadError::Validation(format!(
                "store.backend must be one of: {valid_backends:?}"
            )));
        }
        if self.backend == "redb" && self.path.is_none() {
            return Err(ConfigLoadError::Validation(
                "store.path is required when backend is 'redb'".to_string(),
            ));
        }
        if self.backend == "mongo" && self.uri.is_none() {
            return Err(ConfigLoadError::Validation(
                "store.uri is required when backend is 'mongo'".to_string(),
            ));
        }
        if self.database.is_empty() {
            return Err(ConfigLoadError::Validation(
                "store.database must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_config(&self) -> Result<StoreConfig, ConfigLoadError> {
        match self.backend.as_str() {
            "in_memory" => Ok(StoreConfig::in_memory()),
            "redb" => self
                .path
                .as_ref()
                .map(StoreConfig::redb)
                .ok_or_else(|| ConfigLoadError::MissingField("store.path".to_string())),
            "mongo" => self
                .uri
                .as_ref()
                .map(StoreConfig::mongo)
                .ok_or_else(|| ConfigLoadError::MissingField("store.uri".to_string())),
            other => Err(ConfigLoadError::Validation(format!(
                "unknown store.backend '{other}'"
            ))),
        }
    }
}

impl Default for StoreYamlConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            uri: None,
            database: default_database(),
        }
    }
}

/// Duplication and perturbation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutYamlConfig {
    #[serde(default = "default_source_collection")]
    pub source_collection: String,

    #[serde(default = "default_output_collection")]
    pub output_collection: String,

    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    #[serde(default = "default_copy_field")]
    pub copy_field: String,

    #[serde(default = "default_copies")]
    pub copies: u32,

    #[serde(default = "default_noise_scale")]
    pub noise_scale: f64,

    #[serde(default = "default_noise_offset")]
    pub noise_offset: f64,
}

impl FanoutYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.copies == 0 {
            return Err(ConfigLoadError::Validation(
                "fanout.copies must be >= 1".to_string(),
            ));
        }
        if !self.noise_scale.is_finite() || self.noise_scale <= 0.0 {
            return Err(ConfigLoadError::Validation(
                "fanout.noise_scale must be a positive number".to_string(),
            ));
        }
        if !self.noise_offset.is_finite() {
            return Err(ConfigLoadError::Validation(
                "fanout.noise_offset must be finite".to_string(),
            ));
        }
        for (name, value) in [
            ("fanout.source_collection", &self.source_collection),
            ("fanout.output_collection", &self.output_collection),
            ("fanout.vector_field", &self.vector_field),
            ("fanout.copy_field", &self.copy_field),
        ] {
            if value.is_empty() {
                return Err(ConfigLoadError::Validation(format!(
                    "{name} must not be empty"
                )));
            }
        }
        if self.source_collection == self.output_collection {
            return Err(ConfigLoadError::Validation(
                "fanout.output_collection must differ from fanout.source_collection".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FanoutYamlConfig {
    fn default() -> Self {
        Self {
            source_collection: default_source_collection(),
            output_collection: default_output_collection(),
            vector_field: default_vector_field(),
            copy_field: default_copy_field(),
            copies: default_copies(),
            noise_scale: default_noise_scale(),
            noise_offset: default_noise_offset(),
        }
    }
}

/// Output collections of the projection split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitYamlConfig {
    #[serde(default = "default_vectors_collection")]
    pub vectors_collection: String,

    #[serde(default = "default_metadata_collection")]
    pub metadata_collection: String,
}

impl SplitYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.vectors_collection.is_empty() || self.metadata_collection.is_empty() {
            return Err(ConfigLoadError::Validation(
                "split collections must not be empty".to_string(),
            ));
        }
        if self.vectors_collection == self.metadata_collection {
            return Err(ConfigLoadError::Validation(
                "split.vectors_collection and split.metadata_collection must differ".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SplitYamlConfig {
    fn default() -> Self {
        Self {
            vectors_collection: default_vectors_collection(),
            metadata_collection: default_metadata_collection(),
        }
    }
}

/// Aggregation speed test settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchYamlConfig {
    pub collection: String,

    pub pipeline: Pipeline,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default = "default_calls")]
    pub calls: usize,

    #[serde(default)]
    pub query_values: Option<QueryValues>,
}

impl BenchYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.threads == 0 {
            return Err(ConfigLoadError::Validation(
                "bench.threads must be >= 1".to_string(),
            ));
        }
        if self.calls < self.threads {
            return Err(ConfigLoadError::Validation(
                "bench.calls must be >= bench.threads".to_string(),
            ));
        }
        if self.collection.is_empty() {
            return Err(ConfigLoadError::Validation(
                "bench.collection must not be empty".to_string(),
            ));
        }
        self.pipeline
            .validate()
            .map_err(|e| ConfigLoadError::Validation(format!("bench.pipeline: {e}")))?;
        if let Some(values) = &self.query_values {
            if values.field.is_empty() {
                return Err(ConfigLoadError::Validation(
                    "bench.query_values.field must not be empty".to_string(),
                ));
            }
            values.pipeline.validate().map_err(|e| {
                ConfigLoadError::Validation(format!("bench.query_values.pipeline: {e}"))
            })?;
        }
        Ok(())
    }
}

// Helper functions for serde defaults
fn default_config_version() -> String {
    "1.0".to_string()
}
fn default_backend() -> String {
    "redb".to_string()
}
fn default_store_path() -> Option<String> {
    Some("embedfan.redb".to_string())
}
fn default_database() -> String {
    "sample_mflix".to_string()
}
fn default_source_collection() -> String {
    "embedded_movies".to_string()
}
fn default_output_collection() -> String {
    "movies_with_embed".to_string()
}
fn default_vector_field() -> String {
    "plot_embedding".to_string()
}
fn default_copy_field() -> String {
    "copy".to_string()
}
fn default_copies() -> u32 {
    172
}
fn default_noise_scale() -> f64 {
    0.0000001
}
fn default_noise_offset() -> f64 {
    -0.00000005
}
fn default_vectors_collection() -> String {
    "embeddings_only".to_string()
}
fn default_metadata_collection() -> String {
    "movies_only".to_string()
}
fn default_threads() -> usize {
    1
}
fn default_calls() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_matches_mflix_constants() {
        let config = EmbedfanConfig::default();
        assert_eq!(config.store.database, "sample_mflix");
        assert_eq!(config.fanout.source_collection, "embedded_movies");
        assert_eq!(config.fanout.output_collection, "movies_with_embed");
        assert_eq!(config.fanout.copies, 172);
        assert_eq!(config.fanout.noise_scale, 0.0000001);
        assert_eq!(config.fanout.noise_offset, -0.00000005);
        assert_eq!(config.split.vectors_collection, "embeddings_only");
        assert_eq!(config.split.metadata_collection, "movies_only");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_store_persists_to_redb_file() {
        let config = EmbedfanConfig::from_yaml("fanout:\n  copies: 2\n").unwrap();
        assert_eq!(config.store.backend, "redb");
        assert_eq!(
            config.store.store_config().unwrap(),
            StoreConfig::redb("embedfan.redb")
        );
        assert_eq!(
            StoreYamlConfig::default().store_config().unwrap(),
            StoreConfig::redb("embedfan.redb")
        );
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = EmbedfanConfig::from_yaml("").unwrap();
        assert_eq!(config.fanout.copies, 172);
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
version: "1.0"
store:
  backend: "redb"
  path: "/tmp/embedfan.redb"
fanout:
  copies: 2
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = EmbedfanConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.fanout.copies, 2);
        assert_eq!(config.fanout.vector_field, "plot_embedding");
        assert_eq!(
            config.store.store_config().unwrap(),
            StoreConfig::redb("/tmp/embedfan.redb")
        );
    }

    #[test]
    fn test_zero_copies_rejected() {
        let result = EmbedfanConfig::from_yaml("fanout:\n  copies: 0\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("copies must be >= 1"));
    }

    #[test]
    fn test_mongo_requires_uri() {
        let result = EmbedfanConfig::from_yaml("store:\n  backend: \"mongo\"\n");
        assert!(result.unwrap_err().to_string().contains("store.uri"));
    }

    #[test]
    fn test_unsupported_version() {
        let result = EmbedfanConfig::from_yaml("version: \"2\"\n");
        assert!(matches!(result, Err(ConfigLoadError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_bench_section_parses_pipeline() {
        let yaml = r#"
bench:
  collection: "movies_only"
  threads: 4
  calls: 100
  pipeline:
    - { stage: "match", field: "title", value: "<<VALUE>>" }
  query_values:
    collection: "movies_only"
    field: "title"
    pipeline:
      - { stage: "limit", count: 10 }
"#;
        let config = EmbedfanConfig::from_yaml(yaml).unwrap();
        let bench = config.bench_config().unwrap();
        assert_eq!(bench.threads, 4);
        assert_eq!(bench.pipeline.stages().len(), 1);
        assert_eq!(bench.query_values.unwrap().field, "title");
    }

    #[test]
    fn test_bench_calls_must_cover_threads() {
        let yaml = r#"
bench:
  collection: "movies_only"
  threads: 8
  calls: 4
  pipeline: []
"#;
        let result = EmbedfanConfig::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("bench.calls"));
    }

    #[test]
    fn test_missing_bench_section() {
        let config = EmbedfanConfig::default();
        assert!(matches!(
            config.bench_config(),
            Err(ConfigLoadError::MissingField(_))
        ));
    }

    #[test]
    fn test_split_config_reads_fanout_output() {
        let config = EmbedfanConfig::default();
        let split = config.split_config();
        assert_eq!(split.source_collection, "movies_with_embed");
        assert_eq!(split.vector_field, "plot_embedding");
    }
}
