//! Remediation commands
//!
//! A `RemediationCommand` is the unit of work submitted by an external
//! monitoring system. Parameters are checked against the action type when the
//! command is built, so every command that exists is well-formed: the queue,
//! router and handlers never see a config change without a key or a restart
//! with a zero timeout.
//!
//! Intake JSON accepts snake_case field names (`action_type`, `command_id`)
//! and the camelCase spellings (`actionType`, `commandId`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::cpf;
use crate::error::{OpsError, OpsResult};

pub const MAX_TARGET_LEN: usize = 100;
pub const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Enumerations
// ============================================================================

/// What kind of remediation is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ConfigChange,
    OsReconfig,
    Restart,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [Self::ConfigChange, Self::OsReconfig, Self::Restart];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigChange => "config_change",
            Self::OsReconfig => "os_reconfig",
            Self::Restart => "restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue priority. Variants are declared in dequeue order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Dequeue rank: 0 is served first
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Memory,
    Cpu,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(Self::Memory),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    #[default]
    Graceful,
    Forced,
}

impl RestartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graceful => "graceful",
            Self::Forced => "forced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "graceful" => Some(Self::Graceful),
            "forced" => Some(Self::Forced),
            _ => None,
        }
    }
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Typed parameters
// ============================================================================

/// CPU descriptor for `os_reconfig` with `resource_type = cpu`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<u32>,
}

impl fmt::Display for CpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.cores, self.affinity.is_empty()) {
            (Some(cores), true) => write!(f, "cores={}", cores),
            (Some(cores), false) => write!(f, "cores={} affinity={:?}", cores, self.affinity),
            (None, false) => write!(f, "affinity={:?}", self.affinity),
            (None, true) => f.write_str("default"),
        }
    }
}

/// Target of a resource reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    Megabytes(u64),
    Cpu(CpuSpec),
}

impl fmt::Display for TargetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Megabytes(mb) => write!(f, "{} MB", mb),
            Self::Cpu(spec) => write!(f, "{}", spec),
        }
    }
}

/// Validated, action-specific view of a command's parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParams {
    ConfigChange {
        section: String,
        key: String,
        value: String,
    },
    OsReconfig {
        resource_type: ResourceType,
        target_value: TargetValue,
    },
    Restart {
        mode: RestartMode,
        timeout_seconds: u64,
    },
}

impl ActionParams {
    /// Validate a raw parameter map for the given action
    pub fn from_parameters(action: ActionType, params: &Map<String, Value>) -> OpsResult<Self> {
        match action {
            ActionType::ConfigChange => parse_config_change(params),
            ActionType::OsReconfig => parse_os_reconfig(params),
            ActionType::Restart => parse_restart(params),
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Self::ConfigChange { .. } => ActionType::ConfigChange,
            Self::OsReconfig { .. } => ActionType::OsReconfig,
            Self::Restart { .. } => ActionType::Restart,
        }
    }
}

fn require_keys(action: ActionType, params: &Map<String, Value>, keys: &[&str]) -> OpsResult<()> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| !params.contains_key(*k))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(OpsError::validation(format!(
        "{} requires parameters: {} (missing: {})",
        action,
        keys.join(", "),
        missing.join(", ")
    )))
}

fn string_param(action: ActionType, params: &Map<String, Value>, key: &str) -> OpsResult<String> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(OpsError::validation(format!(
            "{} parameter '{}' must be a string",
            action, key
        ))),
    }
}

fn parse_config_change(params: &Map<String, Value>) -> OpsResult<ActionParams> {
    let action = ActionType::ConfigChange;
    require_keys(action, params, &["section", "key", "value"])?;

    let section = string_param(action, params, "section")?;
    let key = string_param(action, params, "key")?;
    let value = string_param(action, params, "value")?;

    if let Some(problem) = cpf::entry_problem(&section, &key) {
        return Err(OpsError::validation(format!("config_change {}", problem)));
    }
    if value.contains(['\n', '\r']) {
        return Err(OpsError::validation(
            "config_change parameter 'value' must be a single line",
        ));
    }

    Ok(ActionParams::ConfigChange {
        section,
        key,
        value,
    })
}

fn parse_os_reconfig(params: &Map<String, Value>) -> OpsResult<ActionParams> {
    let action = ActionType::OsReconfig;
    require_keys(action, params, &["resource_type", "target_value"])?;

    let resource_type = params
        .get("resource_type")
        .and_then(Value::as_str)
        .and_then(ResourceType::parse)
        .ok_or_else(|| OpsError::validation("os_reconfig resource_type must be 'memory' or 'cpu'"))?;

    let raw = &params["target_value"];
    let target_value = match resource_type {
        ResourceType::Memory => raw.as_u64().map(TargetValue::Megabytes).ok_or_else(|| {
            OpsError::validation("memory target_value must be a non-negative integer (MB)")
        })?,
        ResourceType::Cpu => TargetValue::Cpu(parse_cpu_spec(raw)?),
    };

    Ok(ActionParams::OsReconfig {
        resource_type,
        target_value,
    })
}

fn parse_cpu_spec(raw: &Value) -> OpsResult<CpuSpec> {
    if let Some(cores) = raw.as_u64() {
        let cores = u32::try_from(cores)
            .map_err(|_| OpsError::validation("cpu target_value core count is out of range"))?;
        return Ok(CpuSpec {
            cores: Some(cores),
            affinity: Vec::new(),
        });
    }
    if raw.is_object() {
        return serde_json::from_value(raw.clone()).map_err(|e| {
            OpsError::validation(format!("cpu target_value is not a valid CPU descriptor: {}", e))
        });
    }
    Err(OpsError::validation(
        "cpu target_value must be a core count or an object with cores/affinity",
    ))
}

fn parse_restart(params: &Map<String, Value>) -> OpsResult<ActionParams> {
    let mode = match params.get("mode") {
        None | Some(Value::Null) => RestartMode::default(),
        Some(v) => v
            .as_str()
            .and_then(RestartMode::parse)
            .ok_or_else(|| OpsError::validation("restart mode must be 'graceful' or 'forced'"))?,
    };

    let timeout_seconds = match params.get("timeout_seconds") {
        None | Some(Value::Null) => DEFAULT_RESTART_TIMEOUT_SECS,
        Some(v) => v.as_u64().filter(|t| *t > 0).ok_or_else(|| {
            OpsError::validation("restart timeout_seconds must be a positive integer")
        })?,
    };

    Ok(ActionParams::Restart {
        mode,
        timeout_seconds,
    })
}

// ============================================================================
// Command
// ============================================================================

/// Wire shape of a command, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(
        default,
        alias = "commandId",
        alias = "id",
        skip_serializing_if = "Option::is_none"
    )]
    pub command_id: Option<Uuid>,
    #[serde(alias = "actionType")]
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A validated remediation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CommandPayload", into = "CommandPayload")]
pub struct RemediationCommand {
    id: Uuid,
    action_type: ActionType,
    target: String,
    parameters: Map<String, Value>,
    params: ActionParams,
    priority: Priority,
    requester: Option<String>,
    created_at: DateTime<Utc>,
}

impl RemediationCommand {
    /// Build and validate a command with a fresh id and medium priority
    pub fn new(
        action_type: ActionType,
        target: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> OpsResult<Self> {
        let target = target.into();
        validate_target(&target)?;
        let params = ActionParams::from_parameters(action_type, &parameters)?;

        Ok(Self {
            id: Uuid::new_v4(),
            action_type,
            target,
            parameters,
            params,
            priority: Priority::default(),
            requester: None,
            created_at: Utc::now(),
        })
    }

    /// Parse and validate an intake JSON document
    pub fn from_json(json: &str) -> OpsResult<Self> {
        let payload: CommandPayload = serde_json::from_str(json)
            .map_err(|e| OpsError::validation(format!("invalid command payload: {}", e)))?;
        Self::try_from(payload)
    }

    pub fn config_change(
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> OpsResult<Self> {
        let mut params = Map::new();
        params.insert("section".into(), Value::String(section.into()));
        params.insert("key".into(), Value::String(key.into()));
        params.insert("value".into(), Value::String(value.into()));
        Self::new(ActionType::ConfigChange, "iris.cpf", params)
    }

    pub fn os_reconfig(resource_type: ResourceType, target_value: Value) -> OpsResult<Self> {
        let mut params = Map::new();
        params.insert("resource_type".into(), Value::String(resource_type.as_str().into()));
        params.insert("target_value".into(), target_value);
        Self::new(ActionType::OsReconfig, resource_type.as_str(), params)
    }

    pub fn restart(mode: RestartMode, timeout_seconds: u64) -> OpsResult<Self> {
        let mut params = Map::new();
        params.insert("mode".into(), Value::String(mode.as_str().into()));
        params.insert("timeout_seconds".into(), Value::from(timeout_seconds));
        Self::new(ActionType::Restart, "instance", params)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> OpsResult<Self> {
        let target = target.into();
        validate_target(&target)?;
        self.target = target;
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Raw parameters as submitted
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn params(&self) -> &ActionParams {
        &self.params
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn requester(&self) -> Option<&str> {
        self.requester.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn to_json(&self) -> OpsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn validate_target(target: &str) -> OpsResult<()> {
    if target.trim().is_empty() {
        return Err(OpsError::validation("target must not be empty"));
    }
    if target.chars().count() > MAX_TARGET_LEN {
        return Err(OpsError::validation(format!(
            "target must be at most {} characters",
            MAX_TARGET_LEN
        )));
    }
    Ok(())
}

impl TryFrom<CommandPayload> for RemediationCommand {
    type Error = OpsError;

    fn try_from(payload: CommandPayload) -> Result<Self, Self::Error> {
        let action_type = ActionType::parse(&payload.action_type).ok_or_else(|| {
            OpsError::validation(format!(
                "unknown action_type '{}' (expected config_change, os_reconfig or restart)",
                payload.action_type
            ))
        })?;

        let priority = match payload.priority.as_deref() {
            None => Priority::default(),
            Some(p) => Priority::parse(p).ok_or_else(|| {
                OpsError::validation(format!(
                    "unknown priority '{}' (expected critical, high, medium or low)",
                    p
                ))
            })?,
        };

        let mut command = Self::new(action_type, payload.target, payload.parameters)?;
        command.priority = priority;
        command.requester = payload.requester;
        if let Some(id) = payload.command_id {
            command.id = id;
        }
        if let Some(created_at) = payload.created_at {
            command.created_at = created_at;
        }
        Ok(command)
    }
}

impl From<RemediationCommand> for CommandPayload {
    fn from(command: RemediationCommand) -> Self {
        Self {
            command_id: Some(command.id),
            action_type: command.action_type.as_str().to_string(),
            target: command.target,
            parameters: command.parameters,
            priority: Some(command.priority.as_str().to_string()),
            requester: command.requester,
            created_at: Some(command.created_at),
        }
    }
}
