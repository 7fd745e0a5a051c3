//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::scheduler::SchedulerConfig;
use drover_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub verifier: VerifierSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_owned(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerifierSection {
    /// Base URL of the external verifier. Unset means every attempt
    /// passes (local development only).
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GithubSection {
    /// API token used to open pull requests. Unset disables PR creation;
    /// verified tickets then park in needs_review.
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_concurrent: usize,
    pub lease_secs: f64,
    pub ticket_timeout_secs: u64,
    pub base_poll_ms: u64,
    pub backoff_max_secs: u64,
    pub drain_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// VM pool backend: "process" or "null".
    pub vm_pool: String,
    /// Scratch directory for process-pool slots.
    pub vm_base_dir: Option<PathBuf>,
    /// Command run in the slot for direct-mode tickets.
    pub agent_command: Option<String>,
    /// HTTP bind address for the agent surface.
    pub bind: String,
    pub port: u16,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            max_concurrent: defaults.max_concurrent,
            lease_secs: defaults.lease_secs,
            ticket_timeout_secs: defaults.ticket_timeout.as_secs(),
            base_poll_ms: defaults.base_poll.as_millis() as u64,
            backoff_max_secs: defaults.backoff_max.as_secs(),
            drain_timeout_secs: defaults.drain_timeout.as_secs(),
            reaper_interval_secs: defaults.reaper_interval.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            vm_pool: "process".to_owned(),
            vm_base_dir: None,
            agent_command: None,
            bind: "0.0.0.0".to_owned(),
            port: 7700,
        }
    }
}

impl EngineSection {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            base_poll: Duration::from_millis(self.base_poll_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            lease_secs: self.lease_secs,
            ticket_timeout: Duration::from_secs(self.ticket_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            agent_command: self.agent_command.clone(),
            policies: Default::default(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Return the path of the PID marker written while the engine runs.
pub fn pid_path() -> PathBuf {
    config_dir().join("drover.pid")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub db_config: DbConfig,
    pub verifier_url: Option<String>,
    pub github_token: Option<String>,
    pub engine: EngineSection,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `DROVER_DATABASE_URL` > file > default.
    /// - Verifier URL: `DROVER_VERIFIER_URL` > file > none.
    /// - GitHub token: `DROVER_GITHUB_TOKEN` > file > none.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("DROVER_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let verifier_url = std::env::var("DROVER_VERIFIER_URL")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.verifier.url.clone()));

        let github_token = std::env::var("DROVER_GITHUB_TOKEN")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.github.token.clone()));

        let engine = file_config.map(|c| c.engine).unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(db_url),
            verifier_url,
            github_token,
            engine,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            verifier: VerifierSection {
                url: Some("http://verifier:9000".to_string()),
            },
            github: GithubSection {
                token: Some("ghp_test".to_string()),
            },
            engine: EngineSection::default(),
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.verifier.url, original.verifier.url);
        assert_eq!(loaded.github.token, original.github.token);
        assert_eq!(loaded.engine.max_concurrent, original.engine.max_concurrent);
    }

    #[test]
    fn engine_section_defaults_fill_missing_fields() {
        let cfg: ConfigFile = toml::from_str(
            "[database]\nurl = \"postgresql://h:5432/db\"\n\n[engine]\nmax_concurrent = 8\n",
        )
        .unwrap();
        assert_eq!(cfg.engine.max_concurrent, 8);
        assert_eq!(cfg.engine.vm_pool, "process");
        assert_eq!(cfg.engine.port, 7700);
    }

    #[test]
    fn scheduler_config_conversion() {
        let section = EngineSection {
            max_concurrent: 7,
            lease_secs: 60.0,
            ticket_timeout_secs: 120,
            ..EngineSection::default()
        };
        let sched = section.scheduler_config();
        assert_eq!(sched.max_concurrent, 7);
        assert_eq!(sched.lease_secs, 60.0);
        assert_eq!(sched.ticket_timeout, Duration::from_secs(120));
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DROVER_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = DroverConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("DROVER_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DROVER_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("DROVER_VERIFIER_URL", "http://env-verifier:9000") };

        let config = DroverConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");
        assert_eq!(
            config.verifier_url.as_deref(),
            Some("http://env-verifier:9000")
        );

        unsafe { std::env::remove_var("DROVER_DATABASE_URL") };
        unsafe { std::env::remove_var("DROVER_VERIFIER_URL") };
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("DROVER_DATABASE_URL") };
        unsafe { std::env::remove_var("DROVER_VERIFIER_URL") };
        unsafe { std::env::remove_var("DROVER_GITHUB_TOKEN") };
        // Point HOME and XDG_CONFIG_HOME at a temp dir so load_config()
        // cannot find a real config file.
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let config = DroverConfig::resolve(None);

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        let config = config.unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert!(config.verifier_url.is_none());
        assert!(config.github_token.is_none());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("drover/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
