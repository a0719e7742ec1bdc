//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the botdeck runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_poll_delay() -> Duration {
    Duration::from_millis(2_000)
}

fn default_activity_interval() -> Duration {
    Duration::from_millis(4_000)
}

fn default_uptime_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_command_buffer() -> usize {
    32
}

fn default_event_buffer() -> usize {
    256
}

fn default_base_url() -> Url {
    Url::parse("http://127.0.0.1:8787/").expect("valid default control plane url")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_token_env() -> String {
    "BOTDECK_TOKEN".to_owned()
}

fn default_server_listen() -> SocketAddr {
    "127.0.0.1:8787"
        .parse()
        .expect("valid default server address")
}

fn default_balance() -> f64 {
    100.0
}

fn default_push_buffer() -> usize {
    64
}

fn default_deploy_directory() -> PathBuf {
    PathBuf::from("target/deployments")
}

fn default_public_base_url() -> Url {
    Url::parse("http://127.0.0.1:8787/bots/").expect("valid default deployment url")
}

fn default_repository_prefix() -> String {
    "botdeck".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    "127.0.0.1:9899"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object shared by the daemon and the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BOTDECK_CONFIG";

    /// Load configuration from disk, respecting the `BOTDECK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// A missing file is not fatal: the operator CLI works against a local
    /// daemon with built-in defaults.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.server.validate()?;
        self.deploy.validate()?;
        if self.client.request_timeout.is_zero() {
            return Err(anyhow!("client.request_timeout must be non-zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Cadences and buffer sizes for the lifecycle controller.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_initial_poll_delay", rename = "initial_poll_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_poll_delay: Duration,
    #[serde(default = "default_activity_interval", rename = "activity_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub activity_interval: Duration,
    #[serde(default = "default_uptime_interval", rename = "uptime_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub uptime_interval: Duration,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            initial_poll_delay: default_initial_poll_delay(),
            activity_interval: default_activity_interval(),
            uptime_interval: default_uptime_interval(),
            command_buffer: default_command_buffer(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval < Duration::from_secs(1) {
            return Err(anyhow!("controller.poll_interval must be at least one second"));
        }
        if self.activity_interval.is_zero() || self.uptime_interval.is_zero() {
            return Err(anyhow!("controller ticker intervals must be non-zero"));
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(anyhow!("controller buffers must hold at least one entry"));
        }
        Ok(())
    }
}

/// Where the operator CLI finds the control plane.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: Url,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Source of the bearer credential used by the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token: None,
        }
    }
}

/// Identity bound to a bearer token accepted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_listen")]
    pub listen: SocketAddr,
    /// Bearer token to identity mapping.
    #[serde(default)]
    pub tokens: IndexMap<String, TokenGrant>,
    #[serde(default = "default_balance")]
    pub default_balance: f64,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_push_buffer")]
    pub push_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_server_listen(),
            tokens: IndexMap::new(),
            default_balance: default_balance(),
            snapshot_path: None,
            push_buffer: default_push_buffer(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        let mut uids = std::collections::HashSet::new();
        for (token, grant) in &self.tokens {
            if token.trim().is_empty() {
                return Err(anyhow!("server.tokens contains an empty token"));
            }
            if grant.uid.trim().is_empty() {
                return Err(anyhow!("server token grant is missing a uid"));
            }
            if !uids.insert(grant.uid.as_str()) {
                return Err(anyhow!("server.tokens grants uid {} more than once", grant.uid));
            }
        }
        if self.push_buffer == 0 {
            return Err(anyhow!("server.push_buffer must hold at least one record"));
        }
        if !self.default_balance.is_finite() {
            return Err(anyhow!("server.default_balance must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: Url,
    #[serde(default = "default_repository_prefix")]
    pub repository_prefix: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            directory: default_deploy_directory(),
            public_base_url: default_public_base_url(),
            repository_prefix: default_repository_prefix(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.public_base_url.path().ends_with('/') {
            return Err(anyhow!(
                "deploy.public_base_url {} must end with '/'",
                self.public_base_url
            ));
        }
        if self.repository_prefix.trim().is_empty() {
            return Err(anyhow!("deploy.repository_prefix must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_dashboard_cadence() {
        let config = AppConfig::default();
        assert_eq!(config.controller.poll_interval, Duration::from_secs(10));
        assert_eq!(config.controller.initial_poll_delay, Duration::from_secs(2));
        assert_eq!(config.controller.activity_interval, Duration::from_secs(4));
        assert_eq!(config.controller.uptime_interval, Duration::from_secs(1));
        assert_eq!(config.server.default_balance, 100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = r#"
            [controller]
            poll_interval = 5
            activity_interval_ms = 250

            [client]
            base_url = "http://10.0.0.2:9000/"

            [server.tokens.secret-token]
            uid = "user-1"
            email = "user@example.com"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.controller.poll_interval, Duration::from_secs(5));
        assert_eq!(config.controller.activity_interval, Duration::from_millis(250));
        assert_eq!(config.controller.uptime_interval, Duration::from_secs(1));
        assert_eq!(config.client.base_url.as_str(), "http://10.0.0.2:9000/");
        let grant = config.server.tokens.get("secret-token").unwrap();
        assert_eq!(grant.uid, "user-1");
        assert_eq!(grant.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn rejects_sub_second_poll_interval() {
        let err = "[controller]\npoll_interval = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn rejects_duplicate_token_uids() {
        let err = r#"
            [server.tokens.a]
            uid = "user-1"
            [server.tokens.b]
            uid = "user-1"
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_public_url_without_trailing_slash() {
        let err = "[deploy]\npublic_base_url = \"http://example.com/bots\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("public_base_url"));
    }

    #[test]
    fn load_falls_back_to_defaults_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let loaded = AppConfig::load_with_source(&[missing]).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.server.listen.port(), 8787);
    }

    #[test]
    fn load_reads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botdeck.toml");
        std::fs::write(&path, "[server]\nlisten = \"127.0.0.1:9001\"\n").unwrap();
        let loaded = AppConfig::load_with_source(&[dir.path().join("nope.toml"), path.clone()])
            .unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.server.listen.port(), 9001);
    }
}
