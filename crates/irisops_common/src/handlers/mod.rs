//! Command handlers
//!
//! One handler per agent type. A handler never returns an error past its
//! boundary: every failure becomes a response with `success = false` and an
//! error message, together with whatever was done before the failure.

pub mod config;
pub mod resource;
pub mod restart;

use serde::{Deserialize, Serialize};

use crate::command::RemediationCommand;
use crate::context::RequestContext;
use crate::router::AgentType;

pub use config::{ConfigHandler, ConfigResult};
pub use resource::{ResourceHandler, ResourceResult};
pub use restart::{RestartHandler, RestartResult, RestartStage, RestartStatus};

pub trait Handler: Send + Sync {
    /// The routing target this handler serves
    fn agent(&self) -> AgentType;

    fn handle(&self, command: &RemediationCommand, ctx: &RequestContext) -> HandlerResponse;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerResponse {
    Config(ConfigResult),
    Resource(ResourceResult),
    Restart(RestartResult),
}

impl HandlerResponse {
    pub fn success(&self) -> bool {
        match self {
            Self::Config(r) => r.success,
            Self::Resource(r) => r.success,
            Self::Restart(r) => r.success,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Config(r) => r.error_message.as_deref(),
            Self::Resource(r) => r.error_message.as_deref(),
            Self::Restart(r) => r.error_message.as_deref(),
        }
    }

    /// Audit trail of what the handler did, in order
    pub fn operations(&self) -> &[String] {
        match self {
            Self::Config(r) => &r.operations,
            Self::Resource(r) => &r.commands_executed,
            Self::Restart(r) => &r.commands_executed,
        }
    }
}

/// Message for a command that reached the wrong handler
pub(crate) fn wrong_action(agent: AgentType, command: &RemediationCommand) -> String {
    format!(
        "{} handler cannot execute {} command {}",
        agent,
        command.action_type(),
        command.id()
    )
}
