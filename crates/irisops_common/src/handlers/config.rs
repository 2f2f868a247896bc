//! CPF configuration changes
//!
//! Reads the current value, writes the new one through the transactional
//! store (backup, atomic persist, re-validate, rollback), validates once more
//! and reports whether the instance must restart for the change to apply.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use super::{wrong_action, Handler, HandlerResponse};
use crate::command::{ActionParams, RemediationCommand};
use crate::context::RequestContext;
use crate::cpf::{BackupRef, ConfigStore, StoreError};
use crate::router::AgentType;

const VALIDATION_ROLLED_BACK: &str = "validation failed, changes rolled back";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResult {
    pub success: bool,
    pub section: String,
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub requires_restart: bool,
    pub backup: Option<BackupRef>,
    pub operations: Vec<String>,
    pub error_message: Option<String>,
}

impl ConfigResult {
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_ref().map(|b| b.path.as_path())
    }

    fn failed(section: &str, key: &str, value: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            section: section.to_string(),
            key: key.to_string(),
            old_value: None,
            new_value: value.to_string(),
            requires_restart: false,
            backup: None,
            operations: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}

pub struct ConfigHandler {
    store: Arc<ConfigStore>,
}

impl ConfigHandler {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Change one CPF setting
    pub fn modify(&self, section: &str, key: &str, value: &str) -> ConfigResult {
        let cpf = self.store.path().display().to_string();
        let previous = self.store.read_setting(section, key);
        let mut operations = vec![format!("read [{}] {} from {}", section, key, cpf)];

        let receipt = match self.store.write_setting(section, key, value, true) {
            Ok(receipt) => receipt,
            Err(e) => {
                let message = match &e {
                    StoreError::ValidationFailed { .. } => VALIDATION_ROLLED_BACK.to_string(),
                    other => format!("failed to write configuration setting: {}", other),
                };
                if let Some(backup) = e.backup() {
                    operations.push(format!("backup {} -> {}", cpf, backup.path.display()));
                    if e.rolled_back() {
                        operations.push(format!("restore {} from {}", cpf, backup.path.display()));
                    }
                }
                error!(section, key, error = %e, "Configuration change failed");
                return ConfigResult {
                    old_value: previous,
                    backup: e.backup().cloned(),
                    operations,
                    ..ConfigResult::failed(section, key, value, message)
                };
            }
        };

        if let Some(backup) = &receipt.backup {
            operations.push(format!("backup {} -> {}", cpf, backup.path.display()));
        }
        operations.push(format!("set [{}] {}={}", section, key, value));
        operations.push(format!("validate {}", cpf));

        if let Err(e) = self.store.validate() {
            error!(section, key, error = %e, "CPF failed validation after write");
            if let Some(backup) = &receipt.backup {
                match self.store.restore_backup(backup) {
                    Ok(()) => operations.push(format!("restore {} from {}", cpf, backup.path.display())),
                    Err(restore_err) => {
                        error!(error = %restore_err, "Rollback after failed validation also failed")
                    }
                }
            }
            return ConfigResult {
                old_value: receipt.old_value,
                backup: receipt.backup,
                operations,
                ..ConfigResult::failed(section, key, value, VALIDATION_ROLLED_BACK)
            };
        }

        let requires_restart = ConfigStore::requires_restart(section, key);
        info!(
            section,
            key,
            new_value = value,
            requires_restart,
            "Configuration change applied"
        );

        ConfigResult {
            success: true,
            section: section.to_string(),
            key: key.to_string(),
            old_value: receipt.old_value,
            new_value: value.to_string(),
            requires_restart,
            backup: receipt.backup,
            operations,
            error_message: None,
        }
    }
}

impl Handler for ConfigHandler {
    fn agent(&self) -> AgentType {
        AgentType::Config
    }

    fn handle(&self, command: &RemediationCommand, ctx: &RequestContext) -> HandlerResponse {
        let _span = ctx.span().entered();
        let result = match command.params() {
            ActionParams::ConfigChange {
                section,
                key,
                value,
            } => self.modify(section, key, value),
            _ => ConfigResult::failed("", "", "", wrong_action(self.agent(), command)),
        };
        HandlerResponse::Config(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RestartMode;
    use std::fs;
    use tempfile::TempDir;

    const CPF: &str = "[Startup]\nglobals=10000\n\n[Miscellaneous]\nEnableLongStrings=0\n";

    fn handler() -> (TempDir, ConfigHandler) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iris.cpf");
        fs::write(&path, CPF).unwrap();
        (dir, ConfigHandler::new(Arc::new(ConfigStore::new(path))))
    }

    #[test]
    fn test_modify_startup_setting_requires_restart() {
        let (_dir, handler) = handler();
        let result = handler.modify("Startup", "globals", "20000");

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.old_value.as_deref(), Some("10000"));
        assert_eq!(result.new_value, "20000");
        assert!(result.requires_restart);
        assert!(result.backup_path().unwrap().exists());
        assert_eq!(
            handler.store().read_setting("Startup", "globals").as_deref(),
            Some("20000")
        );
    }

    #[test]
    fn test_modify_misc_setting_needs_no_restart() {
        let (_dir, handler) = handler();
        let result = handler.modify("Miscellaneous", "EnableLongStrings", "1");
        assert!(result.success);
        assert!(!result.requires_restart);
    }

    #[test]
    fn test_rejected_write_is_rolled_back() {
        let (_dir, handler) = handler();
        let result = handler.modify("Startup", "globals", "20000\n%%% not a cpf line");

        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some(VALIDATION_ROLLED_BACK));
        assert!(result.backup.is_some());
        assert!(result.operations.iter().any(|op| op.starts_with("restore")));
        assert_eq!(fs::read_to_string(handler.store().path()).unwrap(), CPF);
    }

    #[test]
    fn test_keys_that_would_not_read_back_are_refused() {
        let (_dir, handler) = handler();
        for key in ["#note", "a=b"] {
            let result = handler.modify("Miscellaneous", key, "42");
            assert!(!result.success, "{} was accepted", key);
            assert!(result.backup.is_none());
            assert!(result.error_message.unwrap().contains("Invalid entry"));
        }
        assert_eq!(fs::read_to_string(handler.store().path()).unwrap(), CPF);
        assert_eq!(handler.store().read_setting("Miscellaneous", "a"), None);
    }

    #[test]
    fn test_missing_cpf_fails_without_backup() {
        let dir = TempDir::new().unwrap();
        let handler = ConfigHandler::new(Arc::new(ConfigStore::new(dir.path().join("iris.cpf"))));
        let result = handler.modify("Startup", "globals", "1");

        assert!(!result.success);
        assert!(result.backup.is_none());
        assert!(result
            .error_message
            .unwrap()
            .starts_with("failed to write configuration setting"));
    }

    #[test]
    fn test_handle_wrong_action() {
        let (_dir, handler) = handler();
        let command = RemediationCommand::restart(RestartMode::Graceful, 60).unwrap();
        let response = handler.handle(&command, &RequestContext::new());
        assert!(!response.success());
        assert!(response.error_message().unwrap().contains("config handler cannot execute restart"));
    }
}
