//! Configuration management for the snapshot engine.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `SNAPVAULT__<SECTION>__<KEY>` environment variables.

use crate::container::Compression;
use crate::scheduler::Cadence;
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `SNAPVAULT__STORE__ROOT=/srv/bucket`.
pub const ENV_PREFIX: &str = "SNAPVAULT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub pack: PackConfig,
    pub retry: RetryConfig,
    pub performance: PerformanceConfig,
    pub log: LogConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Working directory for the ledger and staging files
    pub data_dir: PathBuf,

    /// Where backup containers are written, one subdirectory per logical name
    pub backups_dir: PathBuf,

    /// SQLite file holding the version ledger
    pub ledger_path: PathBuf,

    /// Scratch space for archive staging and restore spooling
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the filesystem-backed object store
    pub root: PathBuf,

    /// Source identifier (key prefix) covered by backups; empty means everything
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Compression algorithm (zstd, none)
    pub compression: String,

    /// Compression level (1-22 for zstd)
    pub compression_level: i32,

    /// Read buffer size in bytes used when streaming objects
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per object, including the first one
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrent object reads while building a manifest
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Default cadence for `schedule run` (see [`Cadence`] for the syntax)
    pub cadence: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            backups_dir: PathBuf::from("./backups"),
            ledger_path: data_dir.join("ledger.db"),
            staging_dir: data_dir.join("staging"),
            data_dir,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./bucket"),
            source: String::new(),
        }
    }
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            compression_level: 3,
            chunk_size: 64 * 1024,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { workers: 8 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cadence: "daily".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default()).map_err(config_err)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.is_file() {
                return Err(EngineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_err)?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document on top of the defaults (no environment layer).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.performance.workers == 0 {
            return Err(EngineError::Config("performance.workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        if self.pack.chunk_size == 0 {
            return Err(EngineError::Config("pack.chunk_size must be positive".into()));
        }
        let compression = self.compression()?;
        if compression == Compression::Zstd
            && !zstd::compression_level_range().contains(&self.pack.compression_level)
        {
            return Err(EngineError::Config(format!(
                "pack.compression_level {} is outside the zstd range {:?}",
                self.pack.compression_level,
                zstd::compression_level_range()
            )));
        }
        self.cadence()?;
        Ok(())
    }

    pub fn compression(&self) -> Result<Compression> {
        self.pack.compression.parse()
    }

    pub fn cadence(&self) -> Result<Cadence> {
        self.schedule.cadence.parse()
    }
}

fn config_err(e: config::ConfigError) -> EngineError {
    EngineError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.compression().unwrap(), Compression::Zstd);
        assert_eq!(config.performance.workers, 8);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [store]
            root = "/srv/bucket"

            [pack]
            compression = "none"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.root, PathBuf::from("/srv/bucket"));
        assert_eq!(config.compression().unwrap(), Compression::None);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml_str("[performance]\nworkers = 0\n").is_err());
        assert!(Config::from_toml_str("[pack]\ncompression = \"lz4\"\n").is_err());
        assert!(Config::from_toml_str("[pack]\ncompression_level = 99\n").is_err());
        assert!(Config::from_toml_str("[schedule]\ncadence = \"hourly-ish\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nbackups_dir = \"/tmp/sv-backups\"\n[retry]\nmax_attempts = 2").unwrap();
        file.flush().unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.backups_dir, PathBuf::from("/tmp/sv-backups"));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.pack.compression, "zstd");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip_of_rendered_config() {
        let rendered = Config::default().to_toml().unwrap();
        let parsed = Config::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.pack.chunk_size, Config::default().pack.chunk_size);
    }
}
