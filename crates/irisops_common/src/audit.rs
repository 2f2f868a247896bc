//! Audit log
//!
//! One JSON line per dispatched command: what was asked, where it was routed,
//! what the handler did and how it ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::command::ActionType;
use crate::dispatcher::DispatchOutcome;
use crate::router::{AgentType, DecisionSource, RiskLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub command_id: Uuid,
    pub action_type: ActionType,
    pub target: String,
    pub agent_type: AgentType,
    pub estimated_risk: RiskLevel,
    pub decision_source: DecisionSource,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,
}

impl AuditRecord {
    pub fn from_outcome(outcome: &DispatchOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: outcome.trace_id,
            workflow_id: outcome.workflow_id,
            command_id: outcome.command_id,
            action_type: outcome.action_type,
            target: outcome.target.clone(),
            agent_type: outcome.decision.agent_type,
            estimated_risk: outcome.decision.estimated_risk,
            decision_source: outcome.decision.source,
            success: outcome.success(),
            error: outcome.error_message().map(str::to_string),
            operations: outcome
                .response
                .as_ref()
                .map(|r| r.operations().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Append-only JSONL audit file
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, record: &AuditRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Most recent records, oldest first. Unparseable lines are skipped.
    pub fn recent(&self, limit: usize) -> io::Result<Vec<AuditRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let records: Vec<AuditRecord> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }
}
