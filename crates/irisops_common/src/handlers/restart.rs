//! Instance restarts
//!
//! Graceful: drain connections (half the budget), stop (the other half),
//! start, settle, health check. Forced: stop immediately with a short fixed
//! ceiling, no drain, then start and check. Each stage entered is recorded so
//! the result shows exactly how far the restart got.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::{wrong_action, Handler, HandlerResponse};
use crate::command::{ActionParams, RemediationCommand, RestartMode};
use crate::context::RequestContext;
use crate::instance::{InstanceControl, OperationalStatus};
use crate::router::AgentType;

pub const FORCED_SHUTDOWN_CEILING: Duration = Duration::from_secs(10);
pub const STARTUP_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStage {
    DrainConnections,
    Shutdown,
    Startup,
    Validate,
}

/// Final state of a restart attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStatus {
    Operational,
    Degraded,
    Error,
    ShutdownFailed,
    StartupFailed,
}

impl From<OperationalStatus> for RestartStatus {
    fn from(status: OperationalStatus) -> Self {
        match status {
            OperationalStatus::Operational => Self::Operational,
            OperationalStatus::Degraded => Self::Degraded,
            OperationalStatus::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartResult {
    pub success: bool,
    pub mode: RestartMode,
    pub connections_drained: u32,
    pub shutdown_duration_seconds: f64,
    pub startup_duration_seconds: f64,
    pub operational_status: RestartStatus,
    pub stages: Vec<RestartStage>,
    pub commands_executed: Vec<String>,
    pub error_message: Option<String>,
}

impl RestartResult {
    fn new(mode: RestartMode) -> Self {
        Self {
            success: false,
            mode,
            connections_drained: 0,
            shutdown_duration_seconds: 0.0,
            startup_duration_seconds: 0.0,
            operational_status: RestartStatus::Error,
            stages: Vec::new(),
            commands_executed: Vec::new(),
            error_message: None,
        }
    }
}

pub struct RestartHandler {
    instance: Arc<dyn InstanceControl>,
    settle_delay: Duration,
}

impl RestartHandler {
    pub fn new(instance: Arc<dyn InstanceControl>, settle_delay: Duration) -> Self {
        Self {
            instance,
            settle_delay,
        }
    }

    pub fn restart(&self, mode: RestartMode, timeout_seconds: u64) -> RestartResult {
        let mut result = RestartResult::new(mode);
        let budget = Duration::from_secs(timeout_seconds);

        let shutdown_timeout = match mode {
            RestartMode::Graceful => {
                let drain_budget = Duration::from_secs(timeout_seconds / 2);
                result.stages.push(RestartStage::DrainConnections);
                let drain_start = Instant::now();
                result.connections_drained = match self.instance.drain_connections(drain_budget) {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(instance = self.instance.name(), error = %e, "Connection drain failed, continuing");
                        0
                    }
                };
                info!(
                    instance = self.instance.name(),
                    drained = result.connections_drained,
                    elapsed_ms = drain_start.elapsed().as_millis() as u64,
                    "Drain stage complete"
                );
                budget - drain_budget
            }
            RestartMode::Forced => FORCED_SHUTDOWN_CEILING,
        };

        result.stages.push(RestartStage::Shutdown);
        let shutdown_start = Instant::now();
        let shutdown = self
            .instance
            .shutdown(mode == RestartMode::Graceful, shutdown_timeout);
        result.shutdown_duration_seconds = shutdown_start.elapsed().as_secs_f64();
        match shutdown {
            Ok(commands) => result.commands_executed.extend(commands),
            Err(e) => {
                let label = match mode {
                    RestartMode::Graceful => "graceful shutdown failed",
                    RestartMode::Forced => "forced shutdown failed",
                };
                error!(instance = self.instance.name(), error = %e, "{}", label);
                result.operational_status = RestartStatus::ShutdownFailed;
                result.error_message = Some(format!("{}: {}", label, e));
                return result;
            }
        }

        result.stages.push(RestartStage::Startup);
        let startup_start = Instant::now();
        let startup = self.instance.startup(STARTUP_CEILING);
        match startup {
            Ok(commands) => result.commands_executed.extend(commands),
            Err(e) => {
                result.startup_duration_seconds = startup_start.elapsed().as_secs_f64();
                error!(instance = self.instance.name(), error = %e, "Instance startup failed");
                result.operational_status = RestartStatus::StartupFailed;
                result.error_message = Some(format!("instance startup failed: {}", e));
                return result;
            }
        }
        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }
        result.startup_duration_seconds = startup_start.elapsed().as_secs_f64();

        result.stages.push(RestartStage::Validate);
        let health = self.instance.health();
        result.operational_status = health.into();
        result.success = health == OperationalStatus::Operational;
        if !result.success {
            result.error_message = Some(format!("post-startup validation failed: instance is {}", health));
        }

        info!(
            instance = self.instance.name(),
            mode = %mode,
            status = %health,
            shutdown_secs = result.shutdown_duration_seconds,
            startup_secs = result.startup_duration_seconds,
            "Restart finished"
        );
        result
    }
}

impl Handler for RestartHandler {
    fn agent(&self) -> AgentType {
        AgentType::Restart
    }

    fn handle(&self, command: &RemediationCommand, ctx: &RequestContext) -> HandlerResponse {
        let _span = ctx.span().entered();
        let result = match command.params() {
            ActionParams::Restart {
                mode,
                timeout_seconds,
            } => self.restart(*mode, *timeout_seconds),
            _ => RestartResult {
                error_message: Some(wrong_action(self.agent(), command)),
                ..RestartResult::new(RestartMode::Graceful)
            },
        };
        HandlerResponse::Restart(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{FakeFailure, FakeInstance};

    fn handler(instance: FakeInstance) -> (Arc<FakeInstance>, RestartHandler) {
        let instance = Arc::new(instance);
        (instance.clone(), RestartHandler::new(instance, Duration::ZERO))
    }

    #[test]
    fn test_graceful_restart_splits_budget() {
        let (fake, handler) = handler(FakeInstance::healthy().with_drained(5));
        let result = handler.restart(RestartMode::Graceful, 60);

        assert!(result.success);
        assert_eq!(result.connections_drained, 5);
        assert_eq!(result.operational_status, RestartStatus::Operational);
        assert_eq!(
            result.stages,
            vec![
                RestartStage::DrainConnections,
                RestartStage::Shutdown,
                RestartStage::Startup,
                RestartStage::Validate,
            ]
        );
        assert_eq!(
            fake.calls(),
            vec!["drain 30s", "shutdown graceful 30s", "startup 30s", "health"]
        );
    }

    #[test]
    fn test_odd_budget_gives_remainder_to_shutdown() {
        let (fake, handler) = handler(FakeInstance::healthy());
        handler.restart(RestartMode::Graceful, 7);
        assert_eq!(fake.calls()[0], "drain 3s");
        assert_eq!(fake.calls()[1], "shutdown graceful 4s");
    }

    #[test]
    fn test_forced_restart_skips_drain() {
        let (fake, handler) = handler(FakeInstance::healthy().with_drained(9));
        let result = handler.restart(RestartMode::Forced, 120);

        assert!(result.success);
        assert_eq!(result.connections_drained, 0);
        assert!(!result.stages.contains(&RestartStage::DrainConnections));
        assert_eq!(fake.calls(), vec!["shutdown forced 10s", "startup 30s", "health"]);
    }

    #[test]
    fn test_shutdown_failure_stops_sequence() {
        let (fake, handler) = handler(
            FakeInstance::healthy().failing_shutdown(FakeFailure::Exec("iris stop exited 1".into())),
        );
        let result = handler.restart(RestartMode::Graceful, 60);

        assert!(!result.success);
        assert_eq!(result.operational_status, RestartStatus::ShutdownFailed);
        assert!(result.error_message.unwrap().starts_with("graceful shutdown failed"));
        assert!(!fake.calls().iter().any(|c| c.starts_with("startup")));
    }

    #[test]
    fn test_forced_shutdown_timeout() {
        let (_fake, handler) = handler(FakeInstance::healthy().failing_shutdown(FakeFailure::Timeout));
        let result = handler.restart(RestartMode::Forced, 60);
        assert_eq!(result.operational_status, RestartStatus::ShutdownFailed);
        let message = result.error_message.unwrap();
        assert!(message.starts_with("forced shutdown failed"));
        assert!(message.contains("timed out"));
    }

    #[test]
    fn test_startup_failure() {
        let (_fake, handler) = handler(
            FakeInstance::healthy().failing_startup(FakeFailure::Exec("license missing".into())),
        );
        let result = handler.restart(RestartMode::Graceful, 60);
        assert!(!result.success);
        assert_eq!(result.operational_status, RestartStatus::StartupFailed);
        assert!(!result.stages.contains(&RestartStage::Validate));
    }

    #[test]
    fn test_degraded_health_is_failure() {
        let (_fake, handler) =
            handler(FakeInstance::healthy().with_health(OperationalStatus::Degraded));
        let result = handler.restart(RestartMode::Graceful, 60);
        assert!(!result.success);
        assert_eq!(result.operational_status, RestartStatus::Degraded);
        assert!(result.error_message.unwrap().contains("post-startup validation failed"));
    }
}
