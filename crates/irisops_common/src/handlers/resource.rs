//! OS resource reconfiguration
//!
//! Memory targets are applied as kernel huge pages: read the current page
//! count, `sysctl -w vm.nr_hugepages=N`, read it back and accept the result
//! when at least the configured fraction of the requested pages exists. CPU
//! descriptors are accepted and recorded but not applied to the system.

use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{wrong_action, Handler, HandlerResponse};
use crate::command::{ActionParams, CpuSpec, RemediationCommand, ResourceType, TargetValue};
use crate::context::RequestContext;
use crate::exec::{display_command, CommandRunner, ExecError};
use crate::privilege::PrivilegeProbe;
use crate::router::AgentType;
use crate::settings::ResourceSettings;

const PERMISSION_DENIED: &str = "insufficient permissions - root or sudo required";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub success: bool,
    pub resource_type: ResourceType,
    pub target_value: TargetValue,
    pub old_value: Option<TargetValue>,
    pub new_value: Option<TargetValue>,
    pub commands_executed: Vec<String>,
    pub validation_passed: bool,
    pub error_message: Option<String>,
}

impl ResourceResult {
    fn new(resource_type: ResourceType, target_value: TargetValue) -> Self {
        Self {
            success: false,
            resource_type,
            target_value,
            old_value: None,
            new_value: None,
            commands_executed: Vec::new(),
            validation_passed: false,
            error_message: None,
        }
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }
}

pub struct ResourceHandler {
    runner: Arc<dyn CommandRunner>,
    privilege: Arc<dyn PrivilegeProbe>,
    settings: ResourceSettings,
}

impl ResourceHandler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        privilege: Arc<dyn PrivilegeProbe>,
        settings: ResourceSettings,
    ) -> Self {
        Self {
            runner,
            privilege,
            settings,
        }
    }

    pub fn reconfigure(&self, resource_type: ResourceType, target_value: &TargetValue) -> ResourceResult {
        let result = ResourceResult::new(resource_type, target_value.clone());

        if !self.privilege.is_privileged() {
            warn!(resource = %resource_type, "Refusing resource change without root");
            return result.fail(PERMISSION_DENIED);
        }

        match (resource_type, target_value) {
            (ResourceType::Memory, TargetValue::Megabytes(mb)) => self.configure_memory(result, *mb),
            (ResourceType::Cpu, TargetValue::Cpu(spec)) => self.configure_cpu(result, spec),
            _ => {
                let message = format!("{} target cannot be {}", resource_type, target_value);
                result.fail(message)
            }
        }
    }

    fn read_huge_pages(&self) -> u64 {
        let path = &self.settings.hugepages_path;
        match fs::read_to_string(path) {
            Ok(content) => content.trim().parse().unwrap_or_else(|_| {
                warn!(path = %path.display(), content = content.trim(), "Unparseable huge page count");
                0
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read huge page count");
                0
            }
        }
    }

    fn configure_memory(&self, mut result: ResourceResult, target_mb: u64) -> ResourceResult {
        let page_mb = self.settings.huge_page_size_mb.max(1);
        let old_pages = self.read_huge_pages();
        result.old_value = Some(TargetValue::Megabytes(old_pages.saturating_mul(page_mb)));

        let target_pages = target_mb / page_mb;
        let setting = format!("vm.nr_hugepages={}", target_pages);
        let args = ["-w", setting.as_str()];
        let timeout = Duration::from_secs(self.settings.command_timeout_secs);
        result.commands_executed.push(display_command("sysctl", &args));

        info!(old_pages, target_pages, "Applying huge page reservation");
        match self.runner.run("sysctl", &args, timeout) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                error!(error = %output.failure_summary(), "sysctl failed");
                return result.fail(output.failure_summary());
            }
            Err(e @ ExecError::Timeout { .. }) => {
                error!(error = %e, "sysctl timed out");
                return result.fail(format!("command timeout: {}", e));
            }
            Err(e) => {
                error!(error = %e, "sysctl could not run");
                return result.fail(e.to_string());
            }
        }

        let new_pages = self.read_huge_pages();
        result.new_value = Some(TargetValue::Megabytes(new_pages.saturating_mul(page_mb)));
        result.validation_passed = new_pages as f64 >= target_pages as f64 * self.settings.tolerance;

        if !result.validation_passed {
            warn!(new_pages, target_pages, "Huge page allocation fell short");
            return result.fail(format!(
                "huge pages allocation fell short of target ({} of {} pages)",
                new_pages, target_pages
            ));
        }

        info!(new_pages, target_pages, "Huge page reservation applied");
        result.success = true;
        result
    }

    fn configure_cpu(&self, mut result: ResourceResult, spec: &CpuSpec) -> ResourceResult {
        debug!(cpu = %spec, "CPU descriptor recorded, no system change applied");
        result.new_value = Some(TargetValue::Cpu(spec.clone()));
        result.validation_passed = true;
        result.success = true;
        result
    }
}

impl Handler for ResourceHandler {
    fn agent(&self) -> AgentType {
        AgentType::Os
    }

    fn handle(&self, command: &RemediationCommand, ctx: &RequestContext) -> HandlerResponse {
        let _span = ctx.span().entered();
        let result = match command.params() {
            ActionParams::OsReconfig {
                resource_type,
                target_value,
            } => self.reconfigure(*resource_type, target_value),
            _ => ResourceResult::new(ResourceType::Memory, TargetValue::Megabytes(0))
                .fail(wrong_action(self.agent(), command)),
        };
        HandlerResponse::Resource(result)
    }
}
