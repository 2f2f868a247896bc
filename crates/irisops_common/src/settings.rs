//! Runtime settings
//!
//! Loaded from TOML. Lookup order: explicit path, `$IRISOPS_CONFIG`, then
//! `/etc/irisops/config.toml`; when none exists the defaults are used.
//! A handful of environment variables override individual fields after the
//! file is read.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{OpsError, OpsResult};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/irisops/config.toml";
pub const CONFIG_PATH_ENV: &str = "IRISOPS_CONFIG";

/// Complete IrisOps configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub instance: InstanceSettings,
    #[serde(default)]
    pub resources: ResourceSettings,
    #[serde(default)]
    pub advisor: AdvisorSettings,
    #[serde(default)]
    pub sender: SenderSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

// ============================================================================
// Sections
// ============================================================================

/// The managed IRIS instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default = "default_cpf_path")]
    pub cpf_path: PathBuf,
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default = "default_control_binary")]
    pub control_binary: String,
    /// Pause between startup and the health check
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Shell command printing the number of active connections
    #[serde(default)]
    pub connection_probe: Option<String>,
}

fn default_cpf_path() -> PathBuf {
    PathBuf::from("/usr/irissys/iris.cpf")
}

fn default_instance_name() -> String {
    "IRIS".to_string()
}

fn default_control_binary() -> String {
    "iris".to_string()
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            cpf_path: default_cpf_path(),
            name: default_instance_name(),
            control_binary: default_control_binary(),
            settle_delay_ms: default_settle_delay_ms(),
            connection_probe: None,
        }
    }
}

/// OS resource reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSettings {
    #[serde(default = "default_hugepages_path")]
    pub hugepages_path: PathBuf,
    #[serde(default = "default_huge_page_size_mb")]
    pub huge_page_size_mb: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Fraction of the requested pages that must be allocated to pass
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_hugepages_path() -> PathBuf {
    PathBuf::from("/proc/sys/vm/nr_hugepages")
}

fn default_huge_page_size_mb() -> u64 {
    2
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_tolerance() -> f64 {
    0.95
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            hugepages_path: default_hugepages_path(),
            huge_page_size_mb: default_huge_page_size_mb(),
            command_timeout_secs: default_command_timeout_secs(),
            tolerance: default_tolerance(),
        }
    }
}

/// Advisory model backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_advisor_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_advisor_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_advisor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_advisor_endpoint() -> String {
    "https://api.openai.com".to_string()
}

fn default_advisor_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_advisor_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_advisor_endpoint(),
            model: default_advisor_model(),
            api_key: None,
            timeout_secs: default_advisor_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// External message endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSettings {
    #[serde(default = "default_sender_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sender_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_sender_endpoint() -> String {
    "http://localhost:8080/api/messages".to_string()
}

fn default_sender_timeout_secs() -> u64 {
    10
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            endpoint: default_sender_endpoint(),
            timeout_secs: default_sender_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    1
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    /// JSONL file receiving one record per dispatched command
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Settings {
    /// Load settings following the lookup order, then apply env overrides.
    ///
    /// An explicitly named file (argument or `$IRISOPS_CONFIG`) must exist and
    /// parse. A broken system-wide file is logged and ignored.
    pub fn load(explicit: Option<&Path>) -> OpsResult<Self> {
        let from_env = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut settings = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => {
                let system = Path::new(SYSTEM_CONFIG_PATH);
                if system.exists() {
                    Self::from_file(system).unwrap_or_else(|e| {
                        warn!(path = %system.display(), error = %e, "Ignoring unreadable settings file");
                        Self::default()
                    })
                } else {
                    debug!("No settings file found, using defaults");
                    Self::default()
                }
            }
        };

        settings.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> OpsResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OpsError::Settings(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| OpsError::Settings(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("IRIS_CPF_PATH") {
            self.instance.cpf_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("IRIS_INSTANCE_NAME") {
            self.instance.name = name;
        }
        if let Some(endpoint) = lookup("EXTERNAL_MESSAGE_ENDPOINT") {
            self.sender.endpoint = endpoint;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            match LogFormat::parse(&format) {
                Some(f) => self.logging.format = f,
                None => warn!(value = %format, "Ignoring unknown LOG_FORMAT"),
            }
        }
        if let Some(key) = lookup("ADVISOR_API_KEY") {
            self.advisor.api_key = Some(key);
        }
    }

    /// Problems that would make the agent misbehave; empty when usable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.instance.name.trim().is_empty() {
            problems.push("instance.name must not be empty".to_string());
        }
        if self.resources.huge_page_size_mb == 0 {
            problems.push("resources.huge_page_size_mb must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.resources.tolerance) || self.resources.tolerance == 0.0 {
            problems.push("resources.tolerance must be in (0, 1]".to_string());
        }
        if self.resources.command_timeout_secs == 0 {
            problems.push("resources.command_timeout_secs must be positive".to_string());
        }
        if self.worker.pool_size == 0 {
            problems.push("worker.pool_size must be at least 1".to_string());
        }
        if self.advisor.max_attempts == 0 {
            problems.push("advisor.max_attempts must be at least 1".to_string());
        }
        if self.advisor.enabled && self.advisor.endpoint.trim().is_empty() {
            problems.push("advisor.endpoint must be set when the advisor is enabled".to_string());
        }
        if !self.sender.endpoint.starts_with("http://") && !self.sender.endpoint.starts_with("https://") {
            problems.push("sender.endpoint must be an http(s) URL".to_string());
        }

        problems
    }
}
