//! Engine configuration
//!
//! Paths, pool sizing and timeouts in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. A file that exists but
//! does not parse is an error.

use prefab_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding prefab's persisted state.
    pub state_dir: PathBuf,
    /// Marker file (inside `state_dir`) whose mtime records the last index refresh.
    pub marker_name: String,
    /// Shared package archive cache.
    pub cache_dir: PathBuf,
    /// apt source list directory.
    pub sources_dir: PathBuf,
    /// Days before the package index counts as stale.
    pub freshness_days: i64,
    /// Concurrent archive downloads.
    pub fetch_workers: usize,
    /// Upper bound on a single archive download.
    pub fetch_timeout_secs: u64,
    /// Upper bound on any external command.
    pub command_timeout_secs: u64,
    /// Package providing `add-apt-repository`.
    pub archive_tool: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/prefab"),
            marker_name: "apt-update".into(),
            cache_dir: PathBuf::from("/var/cache/apt/archives"),
            sources_dir: PathBuf::from("/etc/apt/sources.list.d"),
            freshness_days: 7,
            fetch_workers: 20,
            fetch_timeout_secs: 300,
            command_timeout_secs: 1800,
            archive_tool: "software-properties-common".into(),
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::ConfigError(format!("{}: {}", path.display(), e))),
        };
        let config = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.freshness_days)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_debian_layout() {
        let c = EngineConfig::default();
        assert_eq!(c.state_dir.join(&c.marker_name), Path::new("/var/prefab/apt-update"));
        assert_eq!(c.cache_dir, Path::new("/var/cache/apt/archives"));
        assert_eq!(c.fetch_workers, 20);
        assert_eq!(c.freshness_window(), chrono::Duration::days(7));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: EngineConfig = toml::from_str("fetch_workers = 4\nstate_dir = \"/tmp/prefab\"").unwrap();
        assert_eq!(c.fetch_workers, 4);
        assert_eq!(c.state_dir, Path::new("/tmp/prefab"));
        assert_eq!(c.fetch_timeout_secs, 300);
    }

    #[test]
    fn missing_file_falls_back() {
        let c = EngineConfig::load(Path::new("/nonexistent/prefab.toml")).unwrap();
        assert_eq!(c.archive_tool, "software-properties-common");
    }

    #[test]
    fn malformed_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("prefab.toml");
        std::fs::write(&path, "cache_dir = [unterminated").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(err.to_string().contains("prefab.toml"));
    }

    #[test]
    fn toml_round_trips() {
        let c = EngineConfig::default();
        let back: EngineConfig = toml::from_str(&c.to_toml()).unwrap();
        assert_eq!(back.cache_dir, c.cache_dir);
    }
}
