//! IRIS instance control
//!
//! Draining, stopping, starting and health-checking the database instance.
//! `IrisInstance` drives the `iris` control binary through a `CommandRunner`;
//! `FakeInstance` scripts the same capability for tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{OpsError, OpsResult};
use crate::exec::{display_command, CommandRunner};
use crate::settings::InstanceSettings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(500);

/// Result of a post-startup health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Operational,
    Degraded,
    Error,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operations on the managed instance
pub trait InstanceControl: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for client connections to go away, never longer than `budget`.
    /// Returns how many connections closed.
    fn drain_connections(&self, budget: Duration) -> OpsResult<u32>;

    /// Stop the instance; returns the command lines issued
    fn shutdown(&self, graceful: bool, timeout: Duration) -> OpsResult<Vec<String>>;

    /// Start the instance; returns the command lines issued
    fn startup(&self, timeout: Duration) -> OpsResult<Vec<String>>;

    fn health(&self) -> OperationalStatus;
}

// ============================================================================
// Real instance
// ============================================================================

pub struct IrisInstance {
    name: String,
    control_binary: String,
    runner: Arc<dyn CommandRunner>,
    connection_probe: Option<String>,
    poll_interval: Duration,
}

impl IrisInstance {
    pub fn new(
        name: impl Into<String>,
        control_binary: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            control_binary: control_binary.into(),
            runner,
            connection_probe: None,
            poll_interval: DEFAULT_DRAIN_POLL,
        }
    }

    pub fn from_settings(settings: &InstanceSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let mut instance = Self::new(&settings.name, &settings.control_binary, runner);
        instance.connection_probe = settings.connection_probe.clone();
        instance
    }

    /// Shell command printing the active connection count on stdout
    pub fn with_connection_probe(mut self, probe: impl Into<String>) -> Self {
        self.connection_probe = Some(probe.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn control(&self, args: &[&str], timeout: Duration) -> OpsResult<String> {
        let output = self.runner.run(&self.control_binary, args, timeout)?;
        if !output.success() {
            return Err(OpsError::Exec(output.failure_summary()));
        }
        Ok(display_command(&self.control_binary, args))
    }

    fn count_connections(&self, probe: &str, timeout: Duration) -> OpsResult<u32> {
        let output = self.runner.run("sh", &["-c", probe], timeout)?;
        if !output.success() {
            return Err(OpsError::Exec(output.failure_summary()));
        }
        output.stdout.trim().parse::<u32>().map_err(|_| {
            OpsError::Exec(format!(
                "connection probe printed '{}', expected a number",
                output.stdout.trim()
            ))
        })
    }
}

impl InstanceControl for IrisInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn drain_connections(&self, budget: Duration) -> OpsResult<u32> {
        let Some(probe) = self.connection_probe.as_deref() else {
            debug!(instance = %self.name, "No connection probe configured, nothing to drain");
            return Ok(0);
        };

        let deadline = Instant::now() + budget;
        let initial = self.count_connections(probe, budget.min(PROBE_TIMEOUT))?;
        let mut current = initial;

        while current > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(instance = %self.name, remaining_connections = current, "Drain budget exhausted");
                break;
            }
            thread::sleep(self.poll_interval.min(remaining));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            current = self.count_connections(probe, remaining.min(PROBE_TIMEOUT))?;
        }

        let drained = initial.saturating_sub(current);
        info!(instance = %self.name, drained, remaining_connections = current, "Connections drained");
        Ok(drained)
    }

    fn shutdown(&self, graceful: bool, timeout: Duration) -> OpsResult<Vec<String>> {
        let args: Vec<&str> = if graceful {
            vec!["stop", self.name.as_str(), "quietly"]
        } else {
            vec!["force", self.name.as_str()]
        };
        let command = self.control(&args, timeout)?;
        info!(instance = %self.name, graceful, "Instance stopped");
        Ok(vec![command])
    }

    fn startup(&self, timeout: Duration) -> OpsResult<Vec<String>> {
        let command = self.control(&["start", self.name.as_str()], timeout)?;
        info!(instance = %self.name, "Instance started");
        Ok(vec![command])
    }

    fn health(&self) -> OperationalStatus {
        match self.runner.run(&self.control_binary, &["qlist", self.name.as_str()], HEALTH_TIMEOUT) {
            Ok(output) if output.success() => parse_qlist(&output.stdout, &self.name),
            Ok(output) => {
                warn!(instance = %self.name, error = %output.failure_summary(), "Health check failed");
                OperationalStatus::Error
            }
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Health check failed");
                OperationalStatus::Error
            }
        }
    }
}

/// Interpret `iris qlist` output (`^`-separated; field 4 is the run state,
/// field 9 the system health) for the named instance.
pub fn parse_qlist(output: &str, name: &str) -> OperationalStatus {
    let Some(line) = output
        .lines()
        .find(|l| l.split('^').next().is_some_and(|n| n.eq_ignore_ascii_case(name)))
    else {
        return OperationalStatus::Error;
    };

    let fields: Vec<&str> = line.split('^').collect();
    let running = fields
        .get(3)
        .is_some_and(|s| s.trim().to_ascii_lowercase().starts_with("running"));
    let state = fields
        .get(8)
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match (running, state.as_str()) {
        (true, "ok") => OperationalStatus::Operational,
        (true, "warn") | (true, "alert") => OperationalStatus::Degraded,
        _ => OperationalStatus::Error,
    }
}

// ============================================================================
// Fake instance
// ============================================================================

#[derive(Debug, Clone)]
pub enum FakeFailure {
    Exec(String),
    Timeout,
}

impl FakeFailure {
    fn to_error(&self, operation: &str, timeout: Duration) -> OpsError {
        match self {
            Self::Exec(message) => OpsError::Exec(message.clone()),
            Self::Timeout => OpsError::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            },
        }
    }
}

/// Scripted instance recording each lifecycle call
pub struct FakeInstance {
    drained: u32,
    shutdown_failure: Option<FakeFailure>,
    startup_failure: Option<FakeFailure>,
    health: OperationalStatus,
    calls: Mutex<Vec<String>>,
}

impl FakeInstance {
    pub fn healthy() -> Self {
        Self {
            drained: 0,
            shutdown_failure: None,
            startup_failure: None,
            health: OperationalStatus::Operational,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_drained(mut self, drained: u32) -> Self {
        self.drained = drained;
        self
    }

    pub fn with_health(mut self, health: OperationalStatus) -> Self {
        self.health = health;
        self
    }

    pub fn failing_shutdown(mut self, failure: FakeFailure) -> Self {
        self.shutdown_failure = Some(failure);
        self
    }

    pub fn failing_startup(mut self, failure: FakeFailure) -> Self {
        self.startup_failure = Some(failure);
        self
    }

    /// Lifecycle calls seen so far, e.g. `drain 30s`, `shutdown graceful 30s`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

impl InstanceControl for FakeInstance {
    fn name(&self) -> &str {
        "FAKE"
    }

    fn drain_connections(&self, budget: Duration) -> OpsResult<u32> {
        self.record(format!("drain {}s", budget.as_secs()));
        Ok(self.drained)
    }

    fn shutdown(&self, graceful: bool, timeout: Duration) -> OpsResult<Vec<String>> {
        let mode = if graceful { "graceful" } else { "forced" };
        self.record(format!("shutdown {} {}s", mode, timeout.as_secs()));
        match &self.shutdown_failure {
            Some(failure) => Err(failure.to_error("instance shutdown", timeout)),
            None => Ok(vec![format!("fake stop ({})", mode)]),
        }
    }

    fn startup(&self, timeout: Duration) -> OpsResult<Vec<String>> {
        self.record(format!("startup {}s", timeout.as_secs()));
        match &self.startup_failure {
            Some(failure) => Err(failure.to_error("instance startup", timeout)),
            None => Ok(vec!["fake start".to_string()]),
        }
    }

    fn health(&self) -> OperationalStatus {
        self.record("health".to_string());
        self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, FakeRunner};
    use std::sync::atomic::{AtomicU32, Ordering};

    const QLIST_OK: &str =
        "IRIS^/usr/irissys^2024.1.0.267.2^running, since Fri Mar  1 10:00:00 2024^iris.cpf^1972^52773^62773^ok^IRIS^^^/usr/irissys\n";

    #[test]
    fn test_parse_qlist_states() {
        assert_eq!(parse_qlist(QLIST_OK, "IRIS"), OperationalStatus::Operational);
        assert_eq!(
            parse_qlist(&QLIST_OK.replace("^ok^", "^warn^"), "iris"),
            OperationalStatus::Degraded
        );
        assert_eq!(
            parse_qlist(&QLIST_OK.replace("^ok^", "^alert^"), "IRIS"),
            OperationalStatus::Degraded
        );
        assert_eq!(
            parse_qlist(&QLIST_OK.replace("running, since", "down, last used"), "IRIS"),
            OperationalStatus::Error
        );
        assert_eq!(parse_qlist(QLIST_OK, "OTHER"), OperationalStatus::Error);
        assert_eq!(parse_qlist("", "IRIS"), OperationalStatus::Error);
    }

    #[test]
    fn test_iris_instance_commands() {
        let runner = Arc::new(FakeRunner::new(|program, args| {
            if args.first() == Some(&"qlist") {
                Ok(CommandOutput::ok(program, args, QLIST_OK))
            } else {
                Ok(CommandOutput::ok(program, args, ""))
            }
        }));
        let instance = IrisInstance::new("IRIS", "iris", runner.clone());

        assert_eq!(
            instance.shutdown(true, Duration::from_secs(30)).unwrap(),
            vec!["iris stop IRIS quietly".to_string()]
        );
        assert_eq!(
            instance.shutdown(false, Duration::from_secs(10)).unwrap(),
            vec!["iris force IRIS".to_string()]
        );
        assert_eq!(
            instance.startup(Duration::from_secs(30)).unwrap(),
            vec!["iris start IRIS".to_string()]
        );
        assert_eq!(instance.health(), OperationalStatus::Operational);
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn test_failed_control_command_is_exec_error() {
        let runner = Arc::new(FakeRunner::new(|program, args| {
            Ok(CommandOutput::failed(program, args, 1, "instance not found"))
        }));
        let instance = IrisInstance::new("IRIS", "iris", runner);
        let err = instance.startup(Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, OpsError::Exec(_)));
        assert!(err.to_string().contains("instance not found"));
    }

    #[test]
    fn test_drain_without_probe_is_zero() {
        let runner = Arc::new(FakeRunner::succeeding());
        let instance = IrisInstance::new("IRIS", "iris", runner.clone());
        assert_eq!(instance.drain_connections(Duration::from_secs(30)).unwrap(), 0);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_drain_polls_probe_until_zero() {
        let remaining = Arc::new(AtomicU32::new(3));
        let counter = remaining.clone();
        let runner = Arc::new(FakeRunner::new(move |program, args| {
            let now = counter.load(Ordering::SeqCst);
            counter.store(now.saturating_sub(1), Ordering::SeqCst);
            Ok(CommandOutput::ok(program, args, format!("{}\n", now)))
        }));
        let instance = IrisInstance::new("IRIS", "iris", runner)
            .with_connection_probe("count-connections")
            .with_poll_interval(Duration::from_millis(1));

        assert_eq!(instance.drain_connections(Duration::from_secs(5)).unwrap(), 3);
    }

    #[test]
    fn test_drain_respects_budget() {
        let runner = Arc::new(FakeRunner::new(|program, args| {
            Ok(CommandOutput::ok(program, args, "7"))
        }));
        let instance = IrisInstance::new("IRIS", "iris", runner)
            .with_connection_probe("count-connections")
            .with_poll_interval(Duration::from_millis(10));

        let start = Instant::now();
        assert_eq!(instance.drain_connections(Duration::from_millis(100)).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_fake_instance_records_calls() {
        let fake = FakeInstance::healthy()
            .with_drained(4)
            .failing_startup(FakeFailure::Timeout);
        assert_eq!(fake.drain_connections(Duration::from_secs(30)).unwrap(), 4);
        assert!(fake.shutdown(true, Duration::from_secs(30)).is_ok());
        assert!(fake.startup(Duration::from_secs(30)).unwrap_err().is_timeout());
        assert_eq!(
            fake.calls(),
            vec!["drain 30s", "shutdown graceful 30s", "startup 30s"]
        );
    }
}
