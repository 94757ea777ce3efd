//! TOML configuration loading and validation for the relay.
//!
//! Parsing and the external hot-reload watcher are kept out of the core
//! pipeline crates; this crate is the one place that reads `cfg.toml`.

use std::path::{Path, PathBuf};

use fc_common::{RelayError, Result, SyncConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub source_uri: String,
    pub source_version: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub mongo: MongoConfig,
    #[serde(rename = "sync", default)]
    pub sync: Vec<SyncConfig>,
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "./config/cfg.toml";

    /// Loads and validates a config file, defaulting to [`Config::DEFAULT_PATH`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: PathBuf = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH));
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            RelayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let cfg: Config = toml::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mongo.source_uri.is_empty() {
            return Err(RelayError::Config("mongo.source_uri is required".into()));
        }
        if self.sync.is_empty() {
            return Err(RelayError::Config("at least one [[sync]] block is required".into()));
        }
        for sync in &self.sync {
            sync.validate()?;
        }
        Ok(())
    }

    /// Enabled sync blocks only, in configuration order.
    pub fn enabled_syncs(&self) -> impl Iterator<Item = &SyncConfig> {
        self.sync.iter().filter(|s| s.enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
debug = false

[mongo]
source_uri = "mongodb://localhost:27017"
source_version = 4.2

[[sync]]
enable = true
type = "mongo"
destination_uri = "mongodb://localhost:27018"
source_db = "users"
destination_db = "users_copy"
collections = { people = "persons" }
"#;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_valid_config() {
        let f = write_tmp(VALID);
        let cfg = Config::load(Some(f.path())).unwrap();
        assert_eq!(cfg.mongo.source_version, 4.2);
        assert_eq!(cfg.sync.len(), 1);
        assert_eq!(cfg.sync[0].sync_key(), "mongo|mongodb://localhost:27018|users|users_copy");
    }

    #[test]
    fn rejects_missing_source_uri() {
        let f = write_tmp(
            r#"
[mongo]
source_uri = ""
source_version = 4.2
[[sync]]
enable = true
type = "file"
source_db = "a"
destination_db = "b"
collections = { c = "d" }
"#,
        );
        assert!(Config::load(Some(f.path())).is_err());
    }

    #[test]
    fn rejects_empty_sync_list() {
        let f = write_tmp(
            r#"
[mongo]
source_uri = "mongodb://localhost:27017"
source_version = 4.2
sync = []
"#,
        );
        assert!(Config::load(Some(f.path())).is_err());
    }

    #[test]
    fn file_type_does_not_require_destination_uri() {
        let f = write_tmp(
            r#"
[mongo]
source_uri = "mongodb://localhost:27017"
source_version = 4.2
[[sync]]
enable = true
type = "file"
source_db = "users"
destination_db = "archive"
collections = { people = "people" }
"#,
        );
        assert!(Config::load(Some(f.path())).is_ok());
    }
}
