//! Priority command queue with target conflict detection
//!
//! Commands are ordered by priority (critical, high, medium, low) and then by
//! arrival. A new command is inserted ahead of the first pending command with a
//! strictly lower priority, which keeps equal priorities first-in first-out.
//!
//! Intake never fails the caller: malformed input produces a `Rejected`
//! response carrying the validation message verbatim.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{ActionType, Priority, RemediationCommand};
use crate::error::OpsError;

/// Outcome of submitting a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeResponse {
    Accepted {
        id: Uuid,
        /// 1-based position in the queue right after insertion
        queue_position: usize,
        has_conflict: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflicts_with: Option<Uuid>,
    },
    Rejected {
        error: String,
    },
}

impl IntakeResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            Self::Accepted { id, .. } => Some(*id),
            Self::Rejected { .. } => None,
        }
    }
}

/// Snapshot of pending work. Every priority and action type is present, zero or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_count: usize,
    pub counts_by_priority: BTreeMap<Priority, usize>,
    pub counts_by_action_type: BTreeMap<ActionType, usize>,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    command: RemediationCommand,
    enqueued_at: DateTime<Utc>,
}

/// In-memory priority queue of validated commands
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<QueueEntry>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, validate and enqueue a JSON command document
    pub fn receive(&mut self, payload: &str) -> IntakeResponse {
        match RemediationCommand::from_json(payload) {
            Ok(command) => self.receive_command(command),
            Err(err) => {
                let error = match err {
                    OpsError::Validation(message) => message,
                    other => other.to_string(),
                };
                warn!(error = %error, "Rejected remediation command");
                IntakeResponse::Rejected { error }
            }
        }
    }

    /// Enqueue an already-validated command
    pub fn receive_command(&mut self, command: RemediationCommand) -> IntakeResponse {
        let conflicts_with = self.conflicts_with(command.target());
        if let Some(existing) = conflicts_with {
            warn!(
                command_id = %command.id(),
                conflicts_with = %existing,
                command_target = command.target(),
                "Command targets a resource with pending work"
            );
        }

        let rank = command.priority().rank();
        let index = self
            .entries
            .iter()
            .position(|e| e.command.priority().rank() > rank)
            .unwrap_or(self.entries.len());

        let id = command.id();
        info!(
            command_id = %id,
            action_type = %command.action_type(),
            priority = %command.priority(),
            command_target = command.target(),
            queue_position = index + 1,
            "Command accepted"
        );

        self.entries.insert(
            index,
            QueueEntry {
                command,
                enqueued_at: Utc::now(),
            },
        );

        IntakeResponse::Accepted {
            id,
            queue_position: index + 1,
            has_conflict: conflicts_with.is_some(),
            conflicts_with,
        }
    }

    /// First pending command on the same target, if any
    pub fn conflicts_with(&self, target: &str) -> Option<Uuid> {
        self.entries
            .iter()
            .find(|e| e.command.target() == target)
            .map(|e| e.command.id())
    }

    /// Remove and return the highest-priority command
    pub fn next(&mut self) -> Option<RemediationCommand> {
        let entry = self.entries.pop_front()?;
        let waited = Utc::now() - entry.enqueued_at;
        debug!(
            command_id = %entry.command.id(),
            waited_ms = waited.num_milliseconds(),
            remaining = self.entries.len(),
            "Command dequeued"
        );
        Some(entry.command)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> QueueStatus {
        let mut counts_by_priority: BTreeMap<Priority, usize> =
            Priority::ALL.iter().map(|p| (*p, 0)).collect();
        let mut counts_by_action_type: BTreeMap<ActionType, usize> =
            ActionType::ALL.iter().map(|a| (*a, 0)).collect();

        for entry in &self.entries {
            *counts_by_priority.entry(entry.command.priority()).or_default() += 1;
            *counts_by_action_type.entry(entry.command.action_type()).or_default() += 1;
        }

        QueueStatus {
            total_count: self.entries.len(),
            counts_by_priority,
            counts_by_action_type,
        }
    }
}
