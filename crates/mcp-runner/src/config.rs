//! Runner configuration.
//!
//! Loaded from a TOML file layered with `MCP_RUNNER__SECTION__KEY`
//! environment variables. Every field has a default, so an absent file is a
//! valid configuration.

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::{
    ContainerResult, ContainerRuntime, RegistryCredentials, ResourceLimits, RuntimeType, SupervisorSettings,
};
use crate::launch::LauncherConfig;
use crate::session::{SessionManagerConfig, SessionSettings};

pub const APP_NAME: &str = "mcp-runner";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "MCP_RUNNER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub container: ContainerConfig,
    pub session: SessionConfig,
    pub launcher: LauncherConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL clients use to reach this runner. Defaults to
    /// `http://localhost:<port>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// CORS origins; empty allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_url: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control plane base URL (`ws://` or `wss://`). Without it the runner
    /// only serves HTTP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Consecutive failed connection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Backoff unit; the n-th retry waits n units (capped at 20).
    pub reconnect_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub tags: Vec<String>,
    pub max_concurrent_jobs: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            url: None,
            connection_key: None,
            max_reconnect_attempts: 30,
            reconnect_delay_ms: 500,
            connect_timeout_secs: 10,
            tags: Vec::new(),
            max_concurrent_jobs: 10,
        }
    }
}

impl ControlConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms * u64::from(attempt.clamp(1, 20)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Forced runtime; auto-detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeType>,
    /// Path to the runtime binary, if not on `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    pub start_poll_attempts: u32,
    pub start_poll_interval_ms: u64,
    pub min_healthy_uptime_ms: u64,
    pub limits: ResourceLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryCredentials>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let supervisor = SupervisorSettings::default();
        Self {
            runtime: None,
            binary: None,
            start_poll_attempts: supervisor.start_poll_attempts,
            start_poll_interval_ms: supervisor.start_poll_interval.as_millis() as u64,
            min_healthy_uptime_ms: supervisor.min_healthy_uptime.as_millis() as u64,
            limits: ResourceLimits::default(),
            registry: None,
        }
    }
}

impl ContainerConfig {
    /// Build the runtime client, auto-detecting when nothing is configured.
    pub fn runtime(&self) -> ContainerResult<ContainerRuntime> {
        let runtime = match (self.runtime, &self.binary) {
            (Some(runtime_type), Some(binary)) => ContainerRuntime::with_binary(runtime_type, binary),
            (Some(runtime_type), None) => ContainerRuntime::with_type(runtime_type),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::Docker, binary),
            (None, None) => ContainerRuntime::detect()?,
        };
        Ok(runtime
            .with_limits(self.limits.clone())
            .with_credentials(self.registry.clone()))
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            start_poll_attempts: self.start_poll_attempts,
            start_poll_interval: Duration::from_millis(self.start_poll_interval_ms),
            min_healthy_uptime: Duration::from_millis(self.min_healthy_uptime_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub gc_interval_secs: u64,
    /// How long stopped sessions stay visible as "stopped".
    pub stopped_retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 15,
            ping_timeout_secs: 5,
            gc_interval_secs: 30,
            stopped_retention_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer and audience of session tokens. Random per process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            token_ttl_secs: 30 * 24 * 3600,
        }
    }
}

impl AuthConfig {
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("runner-{}", uuid::Uuid::new_v4()))
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl RunnerConfig {
    /// Load from `path` (missing file is fine) plus the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: Self = built
            .try_deserialize()
            .context("deserializing runner config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("session.ping_interval_secs", self.session.ping_interval_secs),
            ("session.ping_timeout_secs", self.session.ping_timeout_secs),
            ("session.gc_interval_secs", self.session.gc_interval_secs),
            (
                "container.start_poll_interval_ms",
                self.container.start_poll_interval_ms,
            ),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            bail!("{key} must be greater than zero");
        }
        Ok(())
    }

    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            gc_interval: Duration::from_secs(self.session.gc_interval_secs),
            stopped_retention: Duration::from_secs(self.session.stopped_retention_secs),
            session: SessionSettings {
                ping_interval: Duration::from_secs(self.session.ping_interval_secs),
                ping_timeout: Duration::from_secs(self.session.ping_timeout_secs),
                supervisor: self.container.supervisor_settings(),
            },
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
