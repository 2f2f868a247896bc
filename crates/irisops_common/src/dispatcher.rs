//! Command dispatch
//!
//! Routes a command, looks up the handler registered for the chosen agent and
//! runs it. The result is always a `DispatchOutcome`; nothing here returns an
//! error for a command that could not be executed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::advisor::{HttpAdvisor, RetryPolicy};
use crate::audit::{AuditLog, AuditRecord};
use crate::command::{ActionType, RemediationCommand};
use crate::context::RequestContext;
use crate::cpf::ConfigStore;
use crate::error::{OpsError, OpsResult};
use crate::exec::{CommandRunner, SystemRunner};
use crate::handlers::{ConfigHandler, Handler, HandlerResponse, ResourceHandler, RestartHandler};
use crate::instance::IrisInstance;
use crate::privilege::EffectivePrivilege;
use crate::router::{AgentType, Router, RoutingDecision};
use crate::settings::Settings;

/// What happened to one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub command_id: Uuid,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub action_type: ActionType,
    pub target: String,
    pub decision: RoutingDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HandlerResponse>,
    /// Set when no handler ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn handled(
        command: &RemediationCommand,
        ctx: &RequestContext,
        decision: RoutingDecision,
        response: HandlerResponse,
    ) -> Self {
        Self {
            command_id: command.id(),
            trace_id: ctx.trace_id,
            workflow_id: ctx.workflow_id,
            action_type: command.action_type(),
            target: command.target().to_string(),
            decision,
            response: Some(response),
            error: None,
        }
    }

    /// Outcome for a command no handler executed
    pub fn unhandled(
        command: &RemediationCommand,
        ctx: &RequestContext,
        decision: RoutingDecision,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command.id(),
            trace_id: ctx.trace_id,
            workflow_id: ctx.workflow_id,
            action_type: command.action_type(),
            target: command.target().to_string(),
            decision,
            response: None,
            error: Some(message.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.response.as_ref().is_some_and(HandlerResponse::success)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.response.as_ref().and_then(HandlerResponse::error_message))
    }
}

/// Router plus the handler table
pub struct Dispatcher {
    router: Router,
    handlers: HashMap<AgentType, Arc<dyn Handler>>,
    audit: Option<AuditLog>,
}

impl Dispatcher {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            handlers: HashMap::new(),
            audit: None,
        }
    }

    /// Register a handler under the agent it serves, replacing any previous one
    pub fn register(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(handler.agent(), handler);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Production wiring: real CPF store, subprocess runner, IRIS control
    /// binary and, when enabled, the HTTP advisor.
    pub fn from_settings(settings: &Settings) -> OpsResult<Self> {
        let router = match HttpAdvisor::from_settings(&settings.advisor)
            .map_err(|e| OpsError::Settings(format!("advisor: {}", e)))?
        {
            Some(advisor) => Router::with_advisor(advisor, RetryPolicy::from_settings(&settings.advisor)),
            None => Router::rules_only(),
        };

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let store = Arc::new(ConfigStore::new(&settings.instance.cpf_path));
        let instance = Arc::new(IrisInstance::from_settings(&settings.instance, runner.clone()));
        let settle_delay = Duration::from_millis(settings.instance.settle_delay_ms);

        let mut dispatcher = Self::new(router)
            .register(Arc::new(ConfigHandler::new(store)))
            .register(Arc::new(ResourceHandler::new(
                runner,
                Arc::new(EffectivePrivilege),
                settings.resources.clone(),
            )))
            .register(Arc::new(RestartHandler::new(instance, settle_delay)));

        if let Some(path) = &settings.audit.path {
            dispatcher = dispatcher.with_audit(AuditLog::new(path));
        }
        Ok(dispatcher)
    }

    pub fn route(&self, command: &RemediationCommand) -> RoutingDecision {
        self.router.route(command)
    }

    pub fn dispatch(&self, command: &RemediationCommand, ctx: &RequestContext) -> DispatchOutcome {
        let span = ctx.span();
        let decision = span.in_scope(|| {
            let decision = self.router.route(command);
            info!(
                command_id = %command.id(),
                action = %command.action_type(),
                command_target = command.target(),
                agent = %decision.agent_type,
                risk = %decision.estimated_risk,
                "Command routed"
            );
            decision
        });

        let handler = match decision.agent_type {
            AgentType::None => None,
            agent => self.handlers.get(&agent).cloned(),
        };

        let outcome = match handler {
            Some(handler) => {
                let response = handler.handle(command, ctx);
                DispatchOutcome::handled(command, ctx, decision, response)
            }
            None => {
                let message = format!("no handler registered for {} agent", decision.agent_type);
                DispatchOutcome::unhandled(command, ctx, decision, message)
            }
        };

        span.in_scope(|| {
            if outcome.success() {
                info!(command_id = %outcome.command_id, elapsed_ms = ctx.elapsed_ms(), "Command succeeded");
            } else {
                error!(
                    command_id = %outcome.command_id,
                    error = outcome.error_message().unwrap_or("unknown error"),
                    "Command failed"
                );
            }

            if let Some(audit) = &self.audit {
                if let Err(e) = audit.record(&AuditRecord::from_outcome(&outcome)) {
                    warn!(path = %audit.path().display(), error = %e, "Failed to write audit record");
                }
            }
        });

        outcome
    }
}
