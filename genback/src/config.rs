//! Configuration management.
//!
//! Loads configuration from an optional TOML file with `GENBACK__` environment
//! variable overrides (`GENBACK__ENGINE__SYNC=true`, `GENBACK__LOG__LEVEL=debug`).

use crate::executor::Options;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "GENBACK";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub performance: PerformanceConfig,
    pub engine: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Info sink (copied, restored and deleted items)
    pub info_file: Option<PathBuf>,

    /// Error sink (per-item failures and run statistics)
    pub error_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            info_file: None,
            error_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Worker pool size (default: max(cpus, 8), at most 128)
    pub max_concurrency: Option<usize>,
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if any), then environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Engine options with the performance section applied.
    pub fn engine_options(&self) -> Options {
        let mut options = self.engine.clone();
        if self.performance.max_concurrency.is_some() {
            options.concurrency = self.performance.max_concurrency;
        }
        options
    }
}
