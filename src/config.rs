use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngramConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub vector: VectorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine-specific URL. `file:<path>` for a local database file;
    /// `file::memory:` for a process-shared in-memory database.
    pub url: String,
    /// Auth token for a remote sync endpoint. Ignored by the embedded engine.
    pub auth_token: Option<String>,
    /// Remote replica URL. Ignored by the embedded engine.
    pub sync_url: Option<String>,
    /// SQLCipher key, applied only when built with the `encryption` feature.
    pub encryption_key: Option<String>,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub checkout_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_ms: u64,
    pub update_age_on_get: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorConfig {
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            vector: VectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = default_engram_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            url: format!("file:{path}"),
            auth_token: None,
            sync_url: None,
            encryption_key: None,
            max_connections: 10,
            idle_timeout_ms: 30_000,
            checkout_timeout_ms: 10_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_ms: 300_000,
            update_age_on_get: true,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { dimensions: 1536 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl EngramConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngramConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (`DATABASE_URL`, `DATABASE_AUTH_TOKEN`, `LOG_LEVEL`).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database.url = val;
        }
        if let Ok(val) = std::env::var("DATABASE_AUTH_TOKEN") {
            self.database.auth_token = Some(val);
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = val;
        }
    }
}

impl DatabaseConfig {
    /// Whether the URL names an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }

    /// Resolve the database file path from the URL, expanding `~` if needed.
    pub fn resolved_path(&self) -> PathBuf {
        let raw = self.url.strip_prefix("file:").unwrap_or(&self.url);
        expand_tilde(raw)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngramConfig::default();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.idle_timeout_ms, 30_000);
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.cache.ttl_ms, 300_000);
        assert!(config.cache.update_age_on_get);
        assert_eq!(config.vector.dimensions, 1536);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.database.url.ends_with("memory.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[database]
url = "file:/tmp/test.db"
max_connections = 4

[cache]
max_size = 50
ttl_ms = 1000

[vector]
dimensions = 384

[logging]
log_level = "debug"
"#;
        let config: EngramConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.url, "file:/tmp/test.db");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.cache.max_size, 50);
        assert_eq!(config.vector.dimensions, 384);
        assert_eq!(config.logging.log_level, "debug");
        // defaults still apply for unset fields
        assert_eq!(config.database.checkout_timeout_ms, 10_000);
        assert!(config.cache.update_age_on_get);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngramConfig::default();
        std::env::set_var("DATABASE_URL", "file:/tmp/override.db");
        std::env::set_var("DATABASE_AUTH_TOKEN", "token-123");
        std::env::set_var("LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.database.url, "file:/tmp/override.db");
        assert_eq!(config.database.auth_token.as_deref(), Some("token-123"));
        assert_eq!(config.logging.log_level, "trace");

        // Clean up
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("DATABASE_AUTH_TOKEN");
        std::env::remove_var("LOG_LEVEL");
    }

    #[test]
    fn url_path_resolution() {
        let config = DatabaseConfig {
            url: "file:/tmp/engram.db".into(),
            ..DatabaseConfig::default()
        };
        assert!(!config.is_memory());
        assert_eq!(config.resolved_path(), PathBuf::from("/tmp/engram.db"));

        let mem = DatabaseConfig {
            url: "file::memory:".into(),
            ..DatabaseConfig::default()
        };
        assert!(mem.is_memory());
    }
}
