//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PMU_INGEST_LISTEN`, `PMU_INGEST_DATA_DIR`,
//!    `PMU_INGEST_ALIASES`
//! 2. **Config file** — path via `--config <path>`, or `pmu-ingest.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:1883"
//! read_buffer_len = 1024
//!
//! [store]
//! backend = "disk"            # or "memory"
//! data_dir = "/var/lib/pmu-ingest"
//! pool_size = 16
//! fsync = true
//!
//! [protocol]
//! max_file_path_len = 512
//! max_serial_len = 32
//! expected_data_len = 757440
//! max_data_len = 75744000
//!
//! [aliases]
//! path = "/etc/pmu-ingest/aliases.conf"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{FrameLimits, MAX_DATA_LEN, MAX_FILE_PATH_LEN, MAX_SERIAL_LEN};

const DEFAULT_CONFIG_FILE: &str = "pmu-ingest.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub protocol: FrameLimits,
    #[serde(default)]
    pub aliases: AliasConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:1883`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bytes requested from the socket per read (default 1024).
    #[serde(default = "default_read_buffer_len")]
    pub read_buffer_len: usize,
}

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Disk,
    Memory,
}

/// Persistence backend and admission-gate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend (default `disk`).
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Root directory of the disk backend. Default `/var/lib/pmu-ingest`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Number of pooled sessions, i.e. the most frames persisted at once
    /// (default 16).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Sync payloads and index lines to disk before acknowledging (default true).
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// Serial-number alias file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasConfig {
    /// `serial = label` file. Omit to log every device as `UNKNOWN`.
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:1883".to_string()
}
fn default_read_buffer_len() -> usize {
    1024
}
fn default_backend() -> Backend {
    Backend::Disk
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/pmu-ingest")
}
fn default_pool_size() -> usize {
    16
}
fn default_fsync() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_buffer_len: default_read_buffer_len(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            pool_size: default_pool_size(),
            fsync: default_fsync(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `pmu-ingest.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply env-style overrides. `lookup` maps a variable name to its value.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("PMU_INGEST_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = lookup("PMU_INGEST_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(aliases) = lookup("PMU_INGEST_ALIASES") {
            self.aliases.path = Some(PathBuf::from(aliases));
        }
    }

    fn expand_paths(&mut self) {
        self.store.data_dir = expand_tilde(&self.store.data_dir);
        if let Some(path) = &self.aliases.path {
            self.aliases.path = Some(expand_tilde(path));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::Invalid("store.pool_size must be at least 1".into()));
        }
        if self.server.read_buffer_len == 0 {
            return Err(ConfigError::Invalid(
                "server.read_buffer_len must be at least 1".into(),
            ));
        }
        let ceilings = [
            ("protocol.max_file_path_len", self.protocol.max_file_path_len, MAX_FILE_PATH_LEN),
            ("protocol.max_serial_len", self.protocol.max_serial_len, MAX_SERIAL_LEN),
            ("protocol.max_data_len", self.protocol.max_data_len, MAX_DATA_LEN),
        ];
        for (key, value, ceiling) in ceilings {
            if value > ceiling {
                return Err(ConfigError::Invalid(format!(
                    "{key} ({value}) exceeds the protocol maximum ({ceiling})"
                )));
            }
        }
        if self.protocol.expected_data_len > self.protocol.max_data_len {
            return Err(ConfigError::Invalid(format!(
                "protocol.expected_data_len ({}) exceeds protocol.max_data_len ({})",
                self.protocol.expected_data_len, self.protocol.max_data_len
            )));
        }
        Ok(())
    }
}

/// Expand a leading `~` to `$HOME`.
///
/// - `~` → `/home/user`
/// - `~/data` → `/home/user/data`
/// - Anything else passes through unchanged.
fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EXPECTED_DATA_LEN;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.server.listen, "0.0.0.0:1883");
        assert_eq!(c.server.read_buffer_len, 1024);
        assert_eq!(c.store.backend, Backend::Disk);
        assert_eq!(c.store.pool_size, 16);
        assert!(c.store.fsync);
        assert_eq!(c.protocol, FrameLimits::default());
        assert_eq!(c.protocol.expected_data_len, EXPECTED_DATA_LEN);
        assert_eq!(c.protocol.max_data_len, MAX_DATA_LEN);
        assert!(c.aliases.path.is_none());
        assert_eq!(c.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            [store]
            backend = "memory"
            pool_size = 4

            [protocol]
            max_data_len = 1000000
            "#,
        )
        .unwrap();
        assert_eq!(c.store.backend, Backend::Memory);
        assert_eq!(c.store.pool_size, 4);
        assert_eq!(c.store.data_dir, PathBuf::from("/var/lib/pmu-ingest"));
        assert_eq!(c.protocol.max_data_len, 1_000_000);
        assert_eq!(c.protocol.max_serial_len, 32);
        assert_eq!(c.server.listen, "0.0.0.0:1883");
    }

    #[test]
    fn test_overrides() {
        let mut c = Config::default();
        c.apply_overrides(|key| match key {
            "PMU_INGEST_LISTEN" => Some("127.0.0.1:9000".to_string()),
            "PMU_INGEST_ALIASES" => Some("/tmp/aliases.conf".to_string()),
            _ => None,
        });
        assert_eq!(c.server.listen, "127.0.0.1:9000");
        assert_eq!(c.aliases.path, Some(PathBuf::from("/tmp/aliases.conf")));
        assert_eq!(c.store.data_dir, PathBuf::from("/var/lib/pmu-ingest"));
    }

    #[test]
    fn test_validate() {
        let mut c = Config::default();
        assert!(c.validate().is_ok());
        c.store.pool_size = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.protocol.expected_data_len = c.protocol.max_data_len + 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_limits_above_protocol_maximum() {
        let mut c = Config::default();
        c.protocol.max_file_path_len = MAX_FILE_PATH_LEN + 1;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.protocol.max_serial_len = MAX_SERIAL_LEN + 1;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.protocol.max_data_len = MAX_DATA_LEN + 1;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        // Lower limits are fine.
        let mut c = Config::default();
        c.protocol.max_file_path_len = 64;
        c.protocol.max_serial_len = 8;
        c.protocol.expected_data_len = 1024;
        c.protocol.max_data_len = 4096;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_wrapping_path_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmu.toml");
        std::fs::write(&path, "[protocol]\nmax_file_path_len = 4294967295\n").unwrap();
        let err = Config::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmu.toml");
        std::fs::write(&path, "[server]\nread_buffer_len = 4096\n").unwrap();
        let c = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(c.server.read_buffer_len, 4096);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some("/nonexistent/pmu-ingest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[store]\nbackend = \"mongo\"\n").unwrap();
        let err = Config::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_tilde(Path::new("~/data")), PathBuf::from(&home).join("data"));
            assert_eq!(expand_tilde(Path::new("~")), PathBuf::from(home));
        }
    }
}
