use anyhow::Result;
use chrono::Duration as ChronoDuration;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for branchflow
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BranchflowConfig {
    /// Session store and lease settings
    pub sessions: SessionConfig,
    /// Pre-flight validation settings
    pub validation: ValidationConfig,
    /// Executor, timeout and cache settings
    pub concurrency: ConcurrencyConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding one JSON document per session
    pub store_dir: PathBuf,
    /// Sessions older than this can no longer be resumed
    pub ttl_days: u32,
    /// How long a lease stays valid without being released
    pub lease_seconds: u64,
    /// Name recorded in history entries; defaults to `<hostname>:<pid>`
    pub actor: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".branchflow/sessions"),
            ttl_days: 30,
            lease_seconds: 300,
            actor: None,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.ttl_days))
    }

    pub fn lease_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::try_from(self.lease_seconds).unwrap_or(i64::MAX))
    }

    /// Held leases are renewed three times per TTL
    pub fn lease_renew_interval(&self) -> Duration {
        (Duration::from_secs(self.lease_seconds) / 3).max(Duration::from_millis(100))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Exact names or globs (`release/*`) no work may happen on directly
    pub protected_branches: Vec<String>,
    /// Base branch when an operation does not name one
    pub default_base: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec![
                "main".to_string(),
                "master".to_string(),
                "develop".to_string(),
                "release/*".to_string(),
            ],
            default_base: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on external calls in flight within one operation
    pub max_concurrency: usize,
    /// Budget for a single git or platform call
    pub operation_timeout_seconds: u64,
    /// Budget for waiting on CI
    pub ci_wait_timeout_seconds: u64,
    /// How long cached external status stays fresh
    pub cache_ttl_seconds: u64,
    pub cache_capacity: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            operation_timeout_seconds: 120,
            ci_wait_timeout_seconds: 20 * 60,
            cache_ttl_seconds: 30,
            cache_capacity: 128,
        }
    }
}

impl ConcurrencyConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn ci_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ci_wait_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl BranchflowConfig {
    /// Load configuration from the current directory.
    ///
    /// Precedence, lowest first:
    /// 1. Default values
    /// 2. Configuration files (branchflow.toml, .branchflow-rc)
    /// 3. Environment variables (BRANCHFLOW_SECTION__FIELD)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) with files looked up in `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let toml_path = dir.join("branchflow.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".branchflow-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("BRANCHFLOW")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("validation.protected_branches")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let loaded: BranchflowConfig = config.try_deserialize()?;
        tracing::debug!(store_dir = %loaded.sessions.store_dir.display(), "Configuration loaded");
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_files() {
        let temp = TempDir::new().unwrap();
        let config = BranchflowConfig::load_from(temp.path()).unwrap();
        assert_eq!(config.sessions.ttl_days, 30);
        assert_eq!(config.concurrency.ci_wait_timeout(), Duration::from_secs(1200));
        assert_eq!(config.sessions.lease_renew_interval(), Duration::from_secs(100));
        assert!(config
            .validation
            .protected_branches
            .contains(&"release/*".to_string()));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("branchflow.toml"),
            "[sessions]\nttl_days = 7\n\n[validation]\ndefault_base = \"trunk\"\n",
        )
        .unwrap();
        let config = BranchflowConfig::load_from(temp.path()).unwrap();
        assert_eq!(config.sessions.ttl_days, 7);
        assert_eq!(config.sessions.lease_seconds, 300);
        assert_eq!(config.validation.default_base, "trunk");
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let mut config = BranchflowConfig::default();
        config.concurrency.max_concurrency = 9;
        config.save_to_file(temp.path().join("branchflow.toml")).unwrap();
        let reloaded = BranchflowConfig::load_from(temp.path()).unwrap();
        assert_eq!(reloaded, config);
    }
}
