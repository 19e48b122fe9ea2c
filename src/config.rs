//! Engine configuration.
//!
//! All knobs live in one serde-friendly [`EngineConfig`] that can be built
//! in code (builder-style `with_*` methods), loaded from a YAML file, or
//! tweaked through `KVSEARCH_*` environment variables. Validation runs once
//! at engine construction; a bad config never half-starts the engine.
//!
//! ## Example YAML
//!
//! ```yaml
//! mutation_workers: 4
//! reader_workers: 4
//! cluster_mode: true
//! max_indexes: 16
//! block_client_on_mutation: false
//! metadata_broadcast_interval_ms: 30000
//! rdb_write_v2: true
//! rdb_read_v2: true
//! rdb_validate_on_write: false
//! skip_index_load: false
//! read_quota_ms: 10
//! write_quota_ms: 1
//! backfill_batch_size: 1024
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rdb::RdbOptions;
use crate::timeslice::TimeSliceConfig;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Writer-pool width; 0 applies mutations synchronously on the
    /// notifying thread.
    pub mutation_workers: usize,
    /// Reader-pool width; 0 executes searches inline.
    pub reader_workers: usize,
    /// Register schemas with the cluster metadata manager and fan queries
    /// out to peers.
    pub cluster_mode: bool,
    /// Per-database index limit.
    pub max_indexes: usize,
    /// Park the writing client until its mutation applies (host-version
    /// gated in real deployments).
    pub block_client_on_mutation: bool,
    /// Base interval for the metadata header broadcast; each firing jitters
    /// by ±50%.
    pub metadata_broadcast_interval_ms: u64,
    pub rdb_write_v2: bool,
    pub rdb_read_v2: bool,
    pub rdb_validate_on_write: bool,
    /// Load schema definitions but skip index contents; backfill rebuilds.
    pub skip_index_load: bool,
    pub read_quota_ms: u64,
    pub write_quota_ms: u64,
    pub read_grace_us: u64,
    pub write_grace_us: u64,
    /// Keys per backfill tick.
    pub backfill_batch_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mutation_workers: 2,
            reader_workers: 2,
            cluster_mode: false,
            max_indexes: 16,
            block_client_on_mutation: false,
            metadata_broadcast_interval_ms: crate::metadata::DEFAULT_BROADCAST_INTERVAL_MS,
            rdb_write_v2: true,
            rdb_read_v2: true,
            rdb_validate_on_write: false,
            skip_index_load: false,
            read_quota_ms: 10,
            write_quota_ms: 1,
            read_grace_us: 500,
            write_grace_us: 200,
            backfill_batch_size: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mutation_workers(mut self, workers: usize) -> Self {
        self.mutation_workers = workers;
        self
    }

    pub fn with_reader_workers(mut self, workers: usize) -> Self {
        self.reader_workers = workers;
        self
    }

    pub fn with_cluster_mode(mut self, cluster_mode: bool) -> Self {
        self.cluster_mode = cluster_mode;
        self
    }

    pub fn with_max_indexes(mut self, max_indexes: usize) -> Self {
        self.max_indexes = max_indexes;
        self
    }

    pub fn with_broadcast_interval_ms(mut self, interval: u64) -> Self {
        self.metadata_broadcast_interval_ms = interval;
        self
    }

    pub fn with_block_client_on_mutation(mut self, block: bool) -> Self {
        self.block_client_on_mutation = block;
        self
    }

    /// Load from a YAML file and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigLoadError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KVSEARCH_*` environment overrides on top of the current
    /// values. Unparseable values are rejected, unknown variables ignored.
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigLoadError> {
        fn parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigLoadError> {
            match std::env::var(name) {
                Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                    ConfigLoadError::Validation(format!("invalid value for {name}: {raw}"))
                }),
                Err(_) => Ok(None),
            }
        }
        if let Some(value) = parse("KVSEARCH_MUTATION_WORKERS")? {
            self.mutation_workers = value;
        }
        if let Some(value) = parse("KVSEARCH_READER_WORKERS")? {
            self.reader_workers = value;
        }
        if let Some(value) = parse("KVSEARCH_MAX_INDEXES")? {
            self.max_indexes = value;
        }
        if let Some(value) = parse("KVSEARCH_METADATA_BROADCAST_INTERVAL_MS")? {
            self.metadata_broadcast_interval_ms = value;
        }
        if let Some(value) = parse("KVSEARCH_BACKFILL_BATCH_SIZE")? {
            self.backfill_batch_size = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.max_indexes == 0 {
            return Err(ConfigLoadError::Validation(
                "max_indexes must be at least 1".into(),
            ));
        }
        if self.metadata_broadcast_interval_ms == 0 {
            return Err(ConfigLoadError::Validation(
                "metadata_broadcast_interval_ms must be positive".into(),
            ));
        }
        if self.read_quota_ms == 0 || self.write_quota_ms == 0 {
            return Err(ConfigLoadError::Validation(
                "time-slice quotas must be positive".into(),
            ));
        }
        if self.backfill_batch_size == 0 {
            return Err(ConfigLoadError::Validation(
                "backfill_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn time_slice(&self) -> TimeSliceConfig {
        TimeSliceConfig {
            read_quota: Duration::from_millis(self.read_quota_ms),
            write_quota: Duration::from_millis(self.write_quota_ms),
            read_grace: Duration::from_micros(self.read_grace_us),
            write_grace: Duration::from_micros(self.write_grace_us),
        }
    }

    pub fn rdb_options(&self) -> RdbOptions {
        RdbOptions {
            write_v2: self.rdb_write_v2,
            read_v2: self.rdb_read_v2,
            validate_on_write: self.rdb_validate_on_write,
            skip_index_load: self.skip_index_load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn yaml_roundtrip() {
        let config = EngineConfig::from_yaml_str(
            "mutation_workers: 8\ncluster_mode: true\nread_quota_ms: 20\n",
        )
        .unwrap();
        assert_eq!(config.mutation_workers, 8);
        assert!(config.cluster_mode);
        assert_eq!(config.read_quota_ms, 20);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_indexes, 16);
    }

    #[test]
    fn invalid_yaml_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml_str("max_indexes: 0\n"),
            Err(ConfigLoadError::Validation(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("metadata_broadcast_interval_ms: 0\n"),
            Err(ConfigLoadError::Validation(_))
        ));
    }

    #[test]
    fn builder_chain() {
        let config = EngineConfig::new()
            .with_mutation_workers(6)
            .with_cluster_mode(true)
            .with_max_indexes(4)
            .with_broadcast_interval_ms(5_000);
        assert_eq!(config.mutation_workers, 6);
        assert!(config.cluster_mode);
        assert_eq!(config.max_indexes, 4);
        assert_eq!(config.metadata_broadcast_interval_ms, 5_000);
    }

    #[test]
    fn yaml_file_loading() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reader_workers: 7\nrdb_validate_on_write: true").unwrap();
        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.reader_workers, 7);
        assert!(config.rdb_validate_on_write);
    }

    #[test]
    fn time_slice_mapping() {
        let slice = EngineConfig::default().time_slice();
        assert_eq!(slice.read_quota, Duration::from_millis(10));
        assert_eq!(slice.write_quota, Duration::from_millis(1));
    }
}
