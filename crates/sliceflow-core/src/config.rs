//! Engine configuration.
//!
//! [`EngineConfig`] carries the knobs shared by every operator handler of a
//! query: how many worker threads feed the handlers, how finely per-slice
//! state is sharded, and how large emitted batches may grow.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("Invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// A value is outside its allowed range.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Configuration for the windowed execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads executing build operators in parallel.
    pub worker_threads: usize,
    /// Number of key-hash shards per slice (`None` = derived from `worker_threads`).
    pub state_shards: Option<usize>,
    /// Maximum number of rows per emitted output batch.
    pub emit_batch_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            state_shards: None,
            emit_batch_rows: 8192,
        }
    }
}

impl EngineConfig {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parses a JSON document. Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`EngineConfig::from_json`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for zero-valued counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.state_shards == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "state_shards",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.emit_batch_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "emit_batch_rows",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the number of state shards for the given worker count.
    ///
    /// An explicit `state_shards` wins; otherwise four shards per worker,
    /// rounded up to a power of two.
    #[must_use]
    pub fn shards_for(&self, worker_threads: usize) -> usize {
        self.state_shards
            .unwrap_or_else(|| (worker_threads.max(1) * 4).next_power_of_two())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the worker thread count.
    #[must_use]
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.config.worker_threads = worker_threads;
        self
    }

    /// Sets an explicit shard count.
    #[must_use]
    pub fn state_shards(mut self, shards: usize) -> Self {
        self.config.state_shards = Some(shards);
        self
    }

    /// Sets the maximum rows per emitted batch.
    #[must_use]
    pub fn emit_batch_rows(mut self, rows: usize) -> Self {
        self.config.emit_batch_rows = rows;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if validation fails.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
