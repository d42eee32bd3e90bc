//! Runtime configuration.
//!
//! Loaded from a TOML file (all keys optional), then overridden by
//! environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `PRINTLOOM_DATA_DIR` | `data_dir` |
//! | `PRINTLOOM_LOG_LEVEL` | `log_level` |
//! | `PRINTLOOM_SLICER_ENGINE` | `slicer.engine` (`cura` or `orca`) |
//! | `PRINTLOOM_SLICER_PATH` | `slicer.binary` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use printloom_bambu::AdapterOptions;
use printloom_slicer::{SlicerEngine, SlicerOptions};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Scheduler timing and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between ticks.
    #[serde(with = "secs")]
    pub tick_interval: Duration,
    /// A printer whose last report is older than this is not dispatched to.
    #[serde(with = "secs")]
    pub heartbeat_ttl: Duration,
    /// Dispatch attempts per task before it fails.
    pub max_dispatch_attempts: u32,
    /// How long to wait for a stop to show on the status channel.
    #[serde(with = "secs")]
    pub cancel_timeout: Duration,
    /// How long to wait for start, pause and resume to show.
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    /// Finished tasks older than this are purged on startup.
    #[serde(with = "secs")]
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(120),
            max_dispatch_attempts: 2,
            cancel_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(90),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("scheduler.tick_interval must be > 0".into()));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_dispatch_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// LAN transport limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterLinkConfig {
    /// Limit for opening the status channel.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Limit for one upload.
    #[serde(with = "secs")]
    pub transfer_timeout: Duration,
}

impl Default for PrinterLinkConfig {
    fn default() -> Self {
        let options = AdapterOptions::default();
        Self {
            connect_timeout: options.connect_timeout,
            transfer_timeout: options.transfer_timeout,
        }
    }
}

impl PrinterLinkConfig {
    /// Adapter options for the Bambu factory.
    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            connect_timeout: self.connect_timeout,
            transfer_timeout: self.transfer_timeout,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database and job files live here.
    pub data_dir: PathBuf,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// Slicer binary settings.
    pub slicer: SlicerOptions,
    /// Scheduler policy.
    pub scheduler: SchedulerConfig,
    /// Printer transport limits.
    pub printer: PrinterLinkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./printloom-data"),
            log_level: "info".into(),
            log_json: false,
            slicer: SlicerOptions::default(),
            scheduler: SchedulerConfig::default(),
            printer: PrinterLinkConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `path` if given and present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        let config = config.with_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `PRINTLOOM_*` environment overrides.
    pub fn with_env(mut self) -> Self {
        match std::env::var("PRINTLOOM_SLICER_ENGINE").ok().as_deref() {
            Some("cura") => self.slicer.engine = SlicerEngine::Cura,
            Some("orca") => self.slicer.engine = SlicerEngine::Orca,
            Some(other) => tracing::warn!(engine = other, "ignoring unknown PRINTLOOM_SLICER_ENGINE"),
            None => {}
        }
        self.with_overrides(
            std::env::var("PRINTLOOM_DATA_DIR").ok().map(PathBuf::from),
            std::env::var("PRINTLOOM_LOG_LEVEL").ok(),
            std::env::var("PRINTLOOM_SLICER_PATH").ok().map(PathBuf::from),
        )
    }

    /// Replace the fields that have a value.
    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        log_level: Option<String>,
        slicer_path: Option<PathBuf>,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if let Some(binary) = slicer_path {
            self.slicer.binary = Some(binary);
        }
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slicer.timeout.is_zero() {
            return Err(ConfigError::Invalid("slicer.timeout must be > 0".into()));
        }
        self.scheduler.validate()
    }

    /// Database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("printloom.redb")
    }

    /// Directory for toolpaths and containers.
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
        assert_eq!(config.scheduler.cancel_timeout, Duration::from_secs(10));
        assert_eq!(config.scheduler.max_dispatch_attempts, 2);
        assert_eq!(config.slicer.timeout, Duration::from_secs(300));
        assert_eq!(config.database_path(), PathBuf::from("./printloom-data/printloom.redb"));
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            data_dir = "/var/lib/printloom"
            log_json = true

            [slicer]
            binary = "/opt/cura/CuraEngine"
            timeout = 120

            [scheduler]
            tick_interval = 5
            max_dispatch_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/printloom"));
        assert!(config.log_json);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.slicer.engine, SlicerEngine::Cura);
        assert_eq!(config.slicer.binary(), PathBuf::from("/opt/cura/CuraEngine"));
        assert_eq!(config.slicer.timeout, Duration::from_secs(120));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.max_dispatch_attempts, 3);
        assert_eq!(config.scheduler.cancel_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::default().with_overrides(
            Some("/tmp/pl".into()),
            None,
            Some("/usr/bin/CuraEngine".into()),
        );
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pl"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.slicer.binary(), PathBuf::from("/usr/bin/CuraEngine"));
    }

    #[test]
    fn test_orca_engine_key() {
        let config = AppConfig::from_toml("[slicer]\nengine = \"orca\"\n").unwrap();
        assert_eq!(config.slicer.engine, SlicerEngine::Orca);
        assert_eq!(config.slicer.binary(), PathBuf::from("orca-slicer"));
        assert_eq!(config.slicer.timeout, Duration::from_secs(300));

        let bad = AppConfig::from_toml("[slicer]\nengine = \"slic3r\"\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = AppConfig::from_toml("[scheduler]\nmax_dispatch_attempts = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }
}
