//! Daemon configuration
//!
//! Loaded from a TOML file, then overridden by `MOGWAI_*` environment
//! variables (hierarchy: env > file > defaults) and finally validated.
//! Connection tables reference tariff files, which are decoded through the
//! binary codec at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mogwai_schedule::{ConnectionDetails, SchedulerConfig};
use mogwai_tariff::{TariffError, TariffLoader};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors raised while assembling the daemon configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Tariff '{path}' failed to load: {source}")]
    Tariff {
        path: PathBuf,
        source: TariffError,
    },
}

/// Scheduler quota settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    pub max_entries: usize,
    pub max_active_entries: usize,
    pub max_entries_per_owner: usize,
    /// Exit after this many seconds without entries; 0 disables
    pub inactivity_timeout_secs: u64,
    /// How often cached peers are probed for liveness
    pub peer_poll_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let quotas = SchedulerConfig::default();
        Self {
            max_entries: quotas.max_entries,
            max_active_entries: quotas.max_active_entries,
            max_entries_per_owner: quotas.max_entries_per_owner,
            inactivity_timeout_secs: 0,
            peer_poll_interval_secs: 5,
        }
    }
}

/// One configured connection
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSettings {
    pub id: String,
    #[serde(default)]
    pub metered: bool,
    #[serde(default)]
    pub allow_downloads_when_metered: bool,
    #[serde(default = "default_true")]
    pub allow_downloads: bool,
    /// Tariff file, relative to the tariff directory
    #[serde(default)]
    pub tariff: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub scheduler: SchedulerSettings,
    #[serde(rename = "connection")]
    pub connections: Vec<ConnectionSettings>,
}

impl Config {
    /// Load from `path` when present, apply environment overrides, and
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Apply `MOGWAI_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
            match std::env::var(key) {
                Ok(value) => value.parse().map(Some).map_err(|_| {
                    ConfigError::Invalid(format!("{key} is not a valid value: '{value}'"))
                }),
                Err(_) => Ok(None),
            }
        }
        if let Some(value) = parse("MOGWAI_MAX_ENTRIES")? {
            self.scheduler.max_entries = value;
        }
        if let Some(value) = parse("MOGWAI_MAX_ACTIVE_ENTRIES")? {
            self.scheduler.max_active_entries = value;
        }
        if let Some(value) = parse("MOGWAI_MAX_ENTRIES_PER_OWNER")? {
            self.scheduler.max_entries_per_owner = value;
        }
        if let Some(value) = parse("MOGWAI_INACTIVITY_TIMEOUT")? {
            self.scheduler.inactivity_timeout_secs = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be positive".into()));
        }
        if self.scheduler.max_active_entries == 0 {
            return Err(ConfigError::Invalid(
                "max_active_entries must be positive".into(),
            ));
        }
        if self.scheduler.max_entries_per_owner == 0 {
            return Err(ConfigError::Invalid(
                "max_entries_per_owner must be positive".into(),
            ));
        }
        if self.scheduler.peer_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "peer_poll_interval_secs must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for connection in &self.connections {
            if connection.id.is_empty() {
                return Err(ConfigError::Invalid("connection id is empty".into()));
            }
            if !seen.insert(&connection.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connection id '{}'",
                    connection.id
                )));
            }
        }
        Ok(())
    }

    /// Scheduler quotas from the settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_entries: self.scheduler.max_entries,
            max_active_entries: self.scheduler.max_active_entries,
            max_entries_per_owner: self.scheduler.max_entries_per_owner,
        }
    }

    /// Resolve the connection table, loading each referenced tariff file
    /// from `tariff_dir`.
    pub fn connection_table(
        &self,
        tariff_dir: &Path,
    ) -> Result<HashMap<String, ConnectionDetails>, ConfigError> {
        let mut table = HashMap::new();
        for connection in &self.connections {
            let tariff = match &connection.tariff {
                Some(relative) => {
                    let path = tariff_dir.join(relative);
                    let mut loader = TariffLoader::new();
                    loader
                        .load_from_file(&path)
                        .map_err(|source| ConfigError::Tariff {
                            path: path.clone(),
                            source,
                        })?;
                    let tariff = loader.tariff().cloned();
                    info!(
                        connection = %connection.id,
                        tariff = ?tariff.as_ref().map(|t| t.name()),
                        "loaded connection tariff"
                    );
                    tariff
                }
                None => None,
            };
            table.insert(
                connection.id.clone(),
                ConnectionDetails {
                    metered: connection.metered,
                    allow_downloads_when_metered: connection.allow_downloads_when_metered,
                    allow_downloads: connection.allow_downloads,
                    tariff,
                },
            );
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        max_entries = 64
        max_active_entries = 2
        max_entries_per_owner = 8
        inactivity_timeout_secs = 300
        peer_poll_interval_secs = 5

        [[connection]]
        id = "wlan0"
        metered = true
        allow_downloads_when_metered = true

        [[connection]]
        id = "eth0"
    "#;

    #[test]
    fn parses_sample_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.scheduler.max_entries, 64);
        assert_eq!(config.scheduler.max_active_entries, 2);
        assert_eq!(config.connections.len(), 2);
        assert!(config.connections[0].metered);
        // allow_downloads defaults on.
        assert!(config.connections[1].allow_downloads);
        config.validate().unwrap();
    }

    #[test]
    fn defaults_match_scheduler_defaults() {
        let config = Config::default();
        let quotas = config.scheduler_config();
        assert_eq!(quotas.max_entries, 1024);
        assert_eq!(quotas.max_active_entries, 1);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_toml("[scheduler]\nmax_entris = 3\n").is_err());
    }

    #[test]
    fn rejects_zero_active_cap() {
        let config = Config::from_toml("[scheduler]\nmax_active_entries = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_connection_ids() {
        let config = Config::from_toml(
            "[[connection]]\nid = \"eth0\"\n[[connection]]\nid = \"eth0\"\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn connection_table_loads_tariff_files() {
        let dir = tempfile::tempdir().unwrap();
        let period = mogwai_tariff::Period::new(
            "2018-01-01T02:00:00Z".parse().unwrap(),
            "2018-01-01T06:00:00Z".parse().unwrap(),
            mogwai_tariff::RepeatType::Day,
            1,
            mogwai_tariff::CAPACITY_UNLIMITED,
        )
        .unwrap();
        let tariff = mogwai_tariff::Tariff::new("nightly", vec![period]).unwrap();
        std::fs::write(
            dir.path().join("wlan0.tariff"),
            mogwai_tariff::encode_tariff(&tariff).unwrap(),
        )
        .unwrap();

        let config = Config::from_toml(
            "[[connection]]\nid = \"wlan0\"\ntariff = \"wlan0.tariff\"\n",
        )
        .unwrap();
        let table = config.connection_table(dir.path()).unwrap();
        assert_eq!(
            table["wlan0"].tariff.as_ref().map(|t| t.name()),
            Some("nightly")
        );
    }

    #[test]
    fn missing_tariff_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_toml(
            "[[connection]]\nid = \"wlan0\"\ntariff = \"absent.tariff\"\n",
        )
        .unwrap();
        assert!(matches!(
            config.connection_table(dir.path()),
            Err(ConfigError::Tariff { .. })
        ));
    }
}
