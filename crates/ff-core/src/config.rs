use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// Top-level configuration loaded from `~/.ff-agents/config.toml`
/// (or the path in `FF_CONFIG`).
///
/// Worker credentials are never stored here; pass them through
/// `[worker].env` references to the daemon's own environment instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            daemon: DaemonConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Load config from `FF_CONFIG` or `~/.ff-agents/config.toml`, falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.store.query_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "store.query_timeout_ms must be greater than zero".into(),
            ));
        }
        if !matches!(self.general.log_format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Validation(format!(
                "general.log_format must be `pretty` or `json`, got `{}`",
                self.general.log_format
            )));
        }
        if self.agents.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[agents]] entry is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::Validation("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate agent id `{}`",
                    agent.id
                )));
            }
            if agent.roles.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "agent `{}` has no roles",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("FF_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ff-agents")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_name() -> String {
    "fantasy-football-ai".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Log events kept in memory for snapshots; the database keeps everything.
    #[serde(default = "default_log_retain")]
    pub log_retain: usize,
    /// Ad hoc queries are interrupted after this long.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            log_retain: default_log_retain(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Expands a leading `~/` against the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        match self.path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None => PathBuf::from(&self.path),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_store_path() -> String {
    "~/.ff-agents/state.db".into()
}
fn default_log_retain() -> usize {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_patrol_secs")]
    pub patrol_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// 0 means dispatch fails fast when no agent is idle.
    #[serde(default)]
    pub acquire_wait_secs: u64,
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            patrol_secs: default_patrol_secs(),
            max_concurrent: default_max_concurrent(),
            worker_timeout_secs: default_worker_timeout_secs(),
            acquire_wait_secs: 0,
            stalled_after_secs: default_stalled_after_secs(),
            drain_secs: default_drain_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("tick_secs", self.tick_secs),
            ("patrol_secs", self.patrol_secs),
            ("worker_timeout_secs", self.worker_timeout_secs),
            ("stalled_after_secs", self.stalled_after_secs),
            ("max_concurrent", self.max_concurrent as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "scheduler.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn patrol_interval(&self) -> Duration {
        Duration::from_secs(self.patrol_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn acquire_wait(&self) -> Option<Duration> {
        (self.acquire_wait_secs > 0).then(|| Duration::from_secs(self.acquire_wait_secs))
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

fn default_tick_secs() -> u64 {
    30
}
fn default_patrol_secs() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    3
}
fn default_worker_timeout_secs() -> u64 {
    24 * 60 * 60
}
fn default_stalled_after_secs() -> u64 {
    2 * 60 * 60
}
fn default_drain_secs() -> u64 {
    30
}

/// External program that performs the actual work for a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Empty disables execution: runs fail with a worker error.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    9090
}

/// One entry of the agent catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub roles: Vec<Role>,
}

impl AgentSpec {
    fn new(id: &str, name: &str, roles: &[Role]) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: roles.to_vec(),
        }
    }
}

/// The six-agent team the system ships with.
pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec::new("backend-dev-1", "Alex", &[Role::Backend]),
        AgentSpec::new("frontend-dev-1", "Taylor", &[Role::Frontend]),
        AgentSpec::new("data-scientist-1", "Morgan", &[Role::Data]),
        AgentSpec::new("devops-eng-1", "Jordan", &[Role::DevOps]),
        AgentSpec::new("tech-lead-1", "Sam", &[Role::TechLead, Role::Backend]),
        AgentSpec::new("qa-eng-1", "Riley", &[Role::Qa]),
    ]
}
