//! Configuration schema for Kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Worker identity and transport settings
    pub worker: WorkerConfig,

    /// Binary cache settings
    pub cache: CacheConfig,

    /// Repository server settings
    pub repo: RepoConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Worker identity and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifier sent with every repository request
    pub id: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: format!("kiln-{}", uuid::Uuid::new_v4()),
            timeout_secs: 300,
        }
    }
}

/// Binary cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory; unset disables caching entirely
    pub dir: Option<PathBuf>,

    /// Size budget in megabytes
    pub size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            size_mb: 4096,
        }
    }
}

impl CacheConfig {
    /// Budget in bytes.
    pub fn budget_bytes(&self) -> u64 {
        self.size_mb * 1024 * 1024
    }
}

/// Repository server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Default repository server for jobs that name none
    pub server: String,

    /// Source server; never queried for preinstall images
    pub src_server: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            src_server: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.cache.size_mb, 4096);
        assert_eq!(parsed.worker.timeout_secs, 300);
        assert!(parsed.cache.dir.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [cache]
            dir = "/var/cache/kiln"
            size_mb = 128
            "#,
        )
        .unwrap();

        assert_eq!(parsed.cache.dir, Some(PathBuf::from("/var/cache/kiln")));
        assert_eq!(parsed.cache.budget_bytes(), 128 * 1024 * 1024);
        assert_eq!(parsed.general.log_format, "text");
    }

    #[test]
    fn worker_id_defaults_to_a_unique_value() {
        let a = WorkerConfig::default();
        let b = WorkerConfig::default();
        assert!(a.id.starts_with("kiln-"));
        assert_ne!(a.id, b.id);
    }
}
