//! Configuration for a memdb shard process

mod gateway;
mod logging;
mod shard;

pub use gateway::{GatewayConfig, DEFAULT_MAX_MESSAGE_BYTES};
pub use logging::{LogFormat, LogLevel, LoggingConfig, DEFAULT_LOG_DIR};
pub use shard::{ShardConfig, ShardEntry};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Well-known config locations, searched after any explicit `--conf` path
pub const DEFAULT_SEARCH_PATHS: &[&str] = &["./memdb.json", "~/.memdb.json", "/etc/memdb.json"];

/// Errors raised while locating, parsing, or resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found, searched: {}", format_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("please specify shardId with --shard")]
    MissingShardId,

    #[error("shard {0} not exist in config")]
    UnknownShard(String),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Shard table keyed by shard id
    #[serde(default)]
    pub shards: BTreeMap<String, ShardEntry>,
    /// Cache connection settings, passed through to the database
    #[serde(default)]
    pub redis: Value,
    /// Persistent backend settings, passed through to the database
    #[serde(default)]
    pub backend: Value,
    /// Collection definitions, passed through to the database
    #[serde(default)]
    pub collections: Value,
    /// Logging configuration
    #[serde(default)]
    pub logger: LoggingConfig,
    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Build the ordered list of candidate config files.
    ///
    /// An explicit path comes first, followed by [`DEFAULT_SEARCH_PATHS`] with
    /// `~` expanded from `$HOME`.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        let home = std::env::var("HOME").ok();
        explicit
            .map(Path::to_path_buf)
            .into_iter()
            .chain(
                DEFAULT_SEARCH_PATHS
                    .iter()
                    .map(|p| expand_home(p, home.as_deref())),
            )
            .collect()
    }

    /// Load the first existing file among `candidates`
    pub fn discover(candidates: &[PathBuf]) -> Result<(Self, PathBuf), ConfigError> {
        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .ok_or_else(|| ConfigError::NotFound {
                searched: candidates.to_vec(),
            })?;
        let config = Self::load(path)?;
        Ok((config, path.clone()))
    }

    /// Load the first existing candidate and resolve `shard_id` in it.
    ///
    /// A missing shard id is reported only once a config file was found, so
    /// a missing file always wins.
    pub fn resolve(
        candidates: &[PathBuf],
        shard_id: Option<&str>,
    ) -> Result<(Self, ShardConfig), ConfigError> {
        let (config, _path) = Self::discover(candidates)?;
        let shard_id = shard_id.ok_or(ConfigError::MissingShardId)?;
        let shard = config.shard(shard_id)?;
        Ok((config, shard))
    }

    /// Load configuration from a file.
    ///
    /// `.toml` files are parsed as TOML; anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed: Result<Config, String> = if is_toml {
            toml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        let config = parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        for (id, shard) in &self.shards {
            if shard.host.trim().is_empty() {
                errors.push(format!("shard {}: host must not be empty", id));
            }
            if shard.port == 0 {
                errors.push(format!("shard {}: port must be between 1 and 65535", id));
            }
        }

        if self.gateway.max_message_bytes == 0 {
            errors.push("gateway.max_message_bytes must be positive".to_string());
        }
        if self.gateway.request_timeout_ms == Some(0) {
            errors.push("gateway.request_timeout_ms must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Resolve the options of a single shard
    pub fn shard(&self, shard_id: &str) -> Result<ShardConfig, ConfigError> {
        let entry = self
            .shards
            .get(shard_id)
            .ok_or_else(|| ConfigError::UnknownShard(shard_id.to_string()))?;

        Ok(ShardConfig {
            shard_id: shard_id.to_string(),
            host: entry.host.clone(),
            port: entry.port,
            redis: self.redis.clone(),
            backend: self.backend.clone(),
            slave: entry.slave,
            collections: self.collections.clone(),
        })
    }
}

fn expand_home(path: &str, home: Option<&str>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => Path::new(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const SAMPLE: &str = r#"{
        "shards": {
            "s1": {"host": "127.0.0.1", "port": 31017},
            "s2": {"host": "127.0.0.1", "port": 31018, "slave": true}
        },
        "redis": {"host": "127.0.0.1", "port": 6379},
        "backend": {"engine": "mongodb", "url": "mongodb://localhost/test"},
        "collections": {"player": {"indexes": ["areaId"]}},
        "logger": {"path": "/tmp/memdb-logs", "level": "WARN"}
    }"#;

    fn write_json(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json_and_resolve_shard() {
        let file = write_json(SAMPLE);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.logger.level, LogLevel::Warn);
        assert!(config.gateway.request_timeout_ms.is_none());

        let shard = config.shard("s2").unwrap();
        assert_eq!(shard.shard_id, "s2");
        assert_eq!(shard.port, 31018);
        assert!(shard.slave);
        assert_eq!(shard.redis["port"], 6379);
        assert_eq!(shard.listen_addr(), "127.0.0.1:31018");
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(
            br#"
[shards.s1]
host = "0.0.0.0"
port = 4000

[gateway]
request_timeout_ms = 2500
"#,
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.shards["s1"].port, 4000);
        assert_eq!(
            config.gateway.request_timeout(),
            Some(std::time::Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_unknown_shard() {
        let file = write_json(SAMPLE);
        let config = Config::load(file.path()).unwrap();
        let err = config.shard("s9").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownShard(ref id) if id == "s9"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let file = write_json(
            r#"{"shards": {"a": {"host": "", "port": 0}}, "gateway": {"max_message_bytes": 0}}"#,
        );
        match Config::load(file.path()).unwrap_err() {
            ConfigError::Invalid(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let file = write_json("{ not json");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_discover_first_existing_wins() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        std::fs::write(&first, r#"{"shards": {"one": {"host": "h", "port": 1}}}"#).unwrap();
        std::fs::write(&second, r#"{"shards": {"two": {"host": "h", "port": 2}}}"#).unwrap();

        let (config, path) = Config::discover(&[missing, first.clone(), second]).unwrap();
        assert_eq!(path, first);
        assert!(config.shards.contains_key("one"));
    }

    #[test]
    fn test_resolve_requires_shard_id() {
        let file = write_json(SAMPLE);
        let candidates = vec![file.path().to_path_buf()];

        let err = Config::resolve(&candidates, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingShardId));
        assert_eq!(err.to_string(), "please specify shardId with --shard");

        let err = Config::resolve(&candidates, Some("s9")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownShard(_)));

        let (config, shard) = Config::resolve(&candidates, Some("s1")).unwrap();
        assert_eq!(shard.shard_id, "s1");
        assert_eq!(config.logger.level, LogLevel::Warn);
    }

    #[test]
    fn test_resolve_missing_file_reported_before_shard_id() {
        let dir = TempDir::new().unwrap();
        let candidates = vec![dir.path().join("memdb.json")];
        let err = Config::resolve(&candidates, None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_discover_none_found() {
        let dir = TempDir::new().unwrap();
        let candidates = vec![dir.path().join("a.json"), dir.path().join("b.json")];
        match Config::discover(&candidates).unwrap_err() {
            ConfigError::NotFound { searched } => assert_eq!(searched, candidates),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_search_paths_order() {
        let explicit = PathBuf::from("/opt/memdb/conf.json");
        let paths = Config::search_paths(Some(&explicit));
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[0], explicit);
        assert_eq!(paths[1], PathBuf::from("./memdb.json"));
        assert_eq!(paths[3], PathBuf::from("/etc/memdb.json"));

        assert_eq!(Config::search_paths(None).len(), 3);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(
            expand_home("~/.memdb.json", Some("/home/ops")),
            PathBuf::from("/home/ops/.memdb.json")
        );
        assert_eq!(expand_home("~/.memdb.json", None), PathBuf::from("~/.memdb.json"));
        assert_eq!(
            expand_home("/etc/memdb.json", Some("/home/ops")),
            PathBuf::from("/etc/memdb.json")
        );
    }
}
