//! Session tunables
//!
//! Values come from, in increasing priority: built-in defaults, the config
//! file, `PTYTASK_*` environment variables, and command line overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by a scheduler and the sessions it drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on bytes read from a pty per readiness pass
    pub read_chunk_size: usize,
    /// Bytes written from one write-queue lane before the other gets a turn
    pub write_quantum: usize,
    /// Pending input size above which coprocess output stops being read
    pub write_buffer_limit: usize,
    /// How long a stopped child gets to exit before SIGKILL
    pub termination_grace_ms: u64,
    /// Longest time the scheduler sleeps without I/O
    pub poll_interval_ms: u64,
    /// Initial columns when a launch does not give a size
    pub default_cols: u16,
    /// Initial rows when a launch does not give a size
    pub default_rows: u16,
    /// Value of TERM for children started from the command line
    pub term: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 8192,
            write_quantum: 1024,
            write_buffer_limit: 64 * 1024,
            termination_grace_ms: 1000,
            poll_interval_ms: 50,
            default_cols: 80,
            default_rows: 24,
            term: "xterm-256color".to_string(),
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

/// Values given on the command line; `None` leaves the lower layers alone
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub read_chunk_size: Option<usize>,
    pub termination_grace_ms: Option<u64>,
}

impl SessionConfig {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_overrides(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = SessionConfig::default();

        let config_path = overrides
            .config_path
            .clone()
            .or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    // An explicitly named file must load.
                    Err(e) if overrides.config_path.is_some() => return Err(e),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            } else if overrides.config_path.is_some() {
                return Err(ConfigError {
                    message: format!("Config file {} does not exist", path.display()),
                    field: None,
                });
            }
        }

        config.apply_env_vars();
        config.apply_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file: {}", e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    fn apply_env_vars(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    /// Apply `PTYTASK_*` variables as reported by `lookup`; unparsable values are ignored
    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(lookup("PTYTASK_READ_CHUNK_SIZE")) {
            self.read_chunk_size = v;
        }
        if let Some(v) = parsed(lookup("PTYTASK_WRITE_QUANTUM")) {
            self.write_quantum = v;
        }
        if let Some(v) = parsed(lookup("PTYTASK_WRITE_BUFFER_LIMIT")) {
            self.write_buffer_limit = v;
        }
        if let Some(v) = parsed(lookup("PTYTASK_TERMINATION_GRACE_MS")) {
            self.termination_grace_ms = v;
        }
        if let Some(v) = parsed(lookup("PTYTASK_POLL_INTERVAL_MS")) {
            self.poll_interval_ms = v;
        }
        if let Some(val) = lookup("PTYTASK_TERM") {
            self.term = val;
        }
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(cols) = overrides.cols {
            self.default_cols = cols;
        }
        if let Some(rows) = overrides.rows {
            self.default_rows = rows;
        }
        if let Some(size) = overrides.read_chunk_size {
            self.read_chunk_size = size;
        }
        if let Some(grace) = overrides.termination_grace_ms {
            self.termination_grace_ms = grace;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| {
            Err(ConfigError {
                message: message.to_string(),
                field: Some(field.to_string()),
            })
        };

        if self.read_chunk_size == 0 || self.read_chunk_size > 1024 * 1024 {
            return invalid("read_chunk_size", "Read chunk size must be between 1 and 1048576");
        }
        if self.write_quantum == 0 {
            return invalid("write_quantum", "Write quantum must be at least 1");
        }
        if self.write_buffer_limit < self.write_quantum {
            return invalid(
                "write_buffer_limit",
                "Write buffer limit must be at least the write quantum",
            );
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > u64::from(u16::MAX) {
            return invalid("poll_interval_ms", "Poll interval must be between 1 and 65535 ms");
        }
        if self.default_cols == 0 || self.default_rows == 0 {
            return invalid("dimensions", "Default columns and rows must be at least 1");
        }
        if self.term.is_empty() {
            return invalid("term", "TERM must not be empty");
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptytask").join("config.toml"))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.read_chunk_size, 8192);
        assert_eq!(config.write_quantum, 1024);
        assert_eq!((config.default_cols, config.default_rows), (80, 24));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "write_quantum = 256\nterm = \"vt100\"").unwrap();

        let config = SessionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.write_quantum, 256);
        assert_eq!(config.term, "vt100");
        assert_eq!(config.read_chunk_size, 8192);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "write_quantum = \"lots\"").unwrap();
        assert!(SessionConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides_file_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("PTYTASK_WRITE_QUANTUM", "64"),
            ("PTYTASK_POLL_INTERVAL_MS", "soon"),
            ("PTYTASK_TERM", "screen"),
        ]
        .into_iter()
        .collect();

        let mut config = SessionConfig {
            write_quantum: 512,
            ..SessionConfig::default()
        };
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.write_quantum, 64);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.term, "screen");
    }

    #[test]
    fn test_overrides_win() {
        let mut config = SessionConfig::default();
        config.apply_overrides(&ConfigOverrides {
            cols: Some(132),
            termination_grace_ms: Some(10),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.default_cols, 132);
        assert_eq!(config.default_rows, 24);
        assert_eq!(config.termination_grace(), Duration::from_millis(10));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = ConfigOverrides {
            config_path: Some(dir.path().join("missing.toml")),
            ..ConfigOverrides::default()
        };
        assert!(SessionConfig::load_with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_validate_names_the_field() {
        let config = SessionConfig {
            write_quantum: 0,
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("write_quantum"));

        let config = SessionConfig {
            write_buffer_limit: 16,
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("write_buffer_limit"));
        assert!(err.to_string().contains("write_buffer_limit"));
    }
}
