//! Logging configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default base directory for shard log files
pub const DEFAULT_LOG_DIR: &str = "/var/log/memdb";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log severity level
///
/// Older deployments spell levels in upper case (`"INFO"`), both forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "TRACE", alias = "ALL")]
    Trace,
    #[serde(alias = "DEBUG")]
    Debug,
    #[default]
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN")]
    Warn,
    #[serde(alias = "ERROR", alias = "FATAL")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration (the `logger` section of the config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory that receives `memdb-<shard>.log`
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Log level
    #[serde(default)]
    pub level: LogLevel,
    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

impl LoggingConfig {
    /// Log file for the given shard
    pub fn file_for(&self, shard_id: &str) -> PathBuf {
        self.path.join(format!("memdb-{}.log", shard_id))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_accepts_upper_case() {
        let conf: LoggingConfig = serde_json::from_str(r#"{"level": "WARN"}"#).unwrap();
        assert_eq!(conf.level, LogLevel::Warn);
        assert_eq!(conf.path, PathBuf::from(DEFAULT_LOG_DIR));

        let conf: LoggingConfig = serde_json::from_str(r#"{"level": "debug"}"#).unwrap();
        assert_eq!(conf.level, LogLevel::Debug);
    }

    #[test]
    fn test_file_for_shard() {
        let conf = LoggingConfig {
            path: PathBuf::from("/tmp/logs"),
            ..Default::default()
        };
        assert_eq!(conf.file_for("s1"), PathBuf::from("/tmp/logs/memdb-s1.log"));
    }
}
