//! End-to-end remediation flows through the public API
//!
//! Queue intake, routing and dispatch against a temp CPF and the shipped
//! fakes, so nothing here needs root or a real IRIS install.

use irisops_common::handlers::{ConfigHandler, ResourceHandler, RestartHandler, RestartStage, RestartStatus};
use irisops_common::instance::FakeInstance;
use irisops_common::exec::FakeRunner;
use irisops_common::privilege::StaticPrivilege;
use irisops_common::settings::ResourceSettings;
use irisops_common::{
    ActionType, AgentType, CommandQueue, ConfigStore, Dispatcher, HandlerResponse, IntakeResponse, Priority,
    RemediationCommand, RequestContext, ResourceType, RestartMode, Router,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CPF: &str = "[ConfigFile]\nVersion=2024.1\n\n[Startup]\nglobals=10000\n\n[Miscellaneous]\nEnableLongStrings=0\n";

fn payload(action: &str, target: &str, parameters: serde_json::Value, priority: &str) -> String {
    json!({
        "action_type": action,
        "target": target,
        "parameters": parameters,
        "priority": priority,
    })
    .to_string()
}

fn config_payload(key: &str, value: &str, priority: &str) -> String {
    payload(
        "config_change",
        &format!("cpf.{}", key),
        json!({"section": "Startup", "key": key, "value": value}),
        priority,
    )
}

fn temp_cpf() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("iris.cpf");
    fs::write(&path, CPF).unwrap();
    (dir, path)
}

fn dispatcher(cpf: &Path, instance: FakeInstance) -> Dispatcher {
    Dispatcher::new(Router::rules_only())
        .register(Arc::new(ConfigHandler::new(Arc::new(ConfigStore::new(cpf)))))
        .register(Arc::new(RestartHandler::new(Arc::new(instance), Duration::ZERO)))
}

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_priority_order_on_dequeue() {
    let mut queue = CommandQueue::new();
    for (key, priority) in [("a", "low"), ("b", "critical"), ("c", "medium")] {
        assert!(queue.receive(&config_payload(key, "1", priority)).is_accepted());
    }

    let order: Vec<Priority> = std::iter::from_fn(|| queue.next()).map(|c| c.priority()).collect();
    assert_eq!(order, vec![Priority::Critical, Priority::Medium, Priority::Low]);
}

#[test]
fn test_equal_priority_keeps_arrival_order() {
    let mut queue = CommandQueue::new();
    let first = queue.receive(&config_payload("a", "1", "high")).id().unwrap();
    let second = queue.receive(&config_payload("b", "1", "high")).id().unwrap();

    assert_eq!(queue.next().unwrap().id(), first);
    assert_eq!(queue.next().unwrap().id(), second);
}

#[test]
fn test_missing_parameter_rejected_and_queue_unchanged() {
    let mut queue = CommandQueue::new();
    queue.receive(&config_payload("a", "1", "low"));
    let before = queue.status();

    let response = queue.receive(&payload(
        "config_change",
        "cpf",
        json!({"section": "Startup", "key": "globals"}),
        "high",
    ));
    match response {
        IntakeResponse::Rejected { error } => assert!(error.contains("value"), "{}", error),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.status(), before);
}

#[test]
fn test_conflicting_target_is_accepted_and_flagged() {
    let mut queue = CommandQueue::new();
    let first = queue.receive(&config_payload("globals", "1", "low")).id().unwrap();

    match queue.receive(&config_payload("globals", "2", "critical")) {
        IntakeResponse::Accepted {
            queue_position,
            has_conflict,
            conflicts_with,
            ..
        } => {
            assert_eq!(queue_position, 1);
            assert!(has_conflict);
            assert_eq!(conflicts_with, Some(first));
        }
        other => panic!("expected acceptance, got {:?}", other),
    }
    assert_eq!(queue.status().counts_by_action_type[&ActionType::ConfigChange], 2);
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_routing_is_deterministic() {
    let router = Router::rules_only();
    let command = RemediationCommand::restart(RestartMode::Graceful, 60).unwrap();

    let first = router.route(&command);
    let second = router.route(&command);
    assert_eq!(first, second);
    assert_eq!(first.agent_type, AgentType::Restart);
    assert!(first.requires_validation);
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn test_config_change_end_to_end() {
    let (_dir, cpf) = temp_cpf();
    let dispatcher = dispatcher(&cpf, FakeInstance::healthy());
    let command = RemediationCommand::config_change("Startup", "globals", "20000").unwrap();

    let outcome = dispatcher.dispatch(&command, &RequestContext::new());
    assert!(outcome.success(), "{:?}", outcome.error_message());
    let Some(HandlerResponse::Config(result)) = &outcome.response else {
        panic!("expected config response, got {:?}", outcome.response);
    };
    assert_eq!(result.old_value.as_deref(), Some("10000"));
    assert_eq!(result.new_value, "20000");
    assert!(result.requires_restart);

    let backup = result.backup_path().expect("backup recorded");
    assert_eq!(fs::read_to_string(backup).unwrap(), CPF);
    assert!(fs::read_to_string(&cpf).unwrap().contains("globals=20000"));
}

#[test]
fn test_invalid_cpf_write_rolls_back() {
    let (_dir, cpf) = temp_cpf();
    let handler = ConfigHandler::new(Arc::new(ConfigStore::new(&cpf)));

    let result = handler.modify("Startup", "globals", "20000\n%%% not a cpf line");
    assert!(!result.success);
    assert!(result.backup_path().is_some());
    assert_eq!(fs::read_to_string(&cpf).unwrap(), CPF);
}

#[test]
fn test_forced_restart_skips_drain() {
    let (_dir, cpf) = temp_cpf();
    let dispatcher = dispatcher(&cpf, FakeInstance::healthy().with_drained(7));
    let command = RemediationCommand::restart(RestartMode::Forced, 60).unwrap();

    let outcome = dispatcher.dispatch(&command, &RequestContext::new());
    let Some(HandlerResponse::Restart(result)) = &outcome.response else {
        panic!("expected restart response, got {:?}", outcome.response);
    };
    assert!(result.success);
    assert_eq!(result.connections_drained, 0);
    assert!(!result.stages.contains(&RestartStage::DrainConnections));
    assert_eq!(result.operational_status, RestartStatus::Operational);
}

#[test]
fn test_graceful_restart_drains_with_half_budget() {
    let instance = Arc::new(FakeInstance::healthy().with_drained(4));
    let handler = RestartHandler::new(instance.clone(), Duration::ZERO);

    let result = handler.restart(RestartMode::Graceful, 60);
    assert!(result.success);
    assert_eq!(result.connections_drained, 4);
    assert_eq!(
        result.stages,
        vec![
            RestartStage::DrainConnections,
            RestartStage::Shutdown,
            RestartStage::Startup,
            RestartStage::Validate
        ]
    );
    assert_eq!(instance.calls().first().map(String::as_str), Some("drain 30s"));
}

#[test]
fn test_resource_change_without_root_runs_nothing() {
    let runner = Arc::new(FakeRunner::succeeding());
    let handler = ResourceHandler::new(runner.clone(), Arc::new(StaticPrivilege(false)), ResourceSettings::default());
    let dispatcher = Dispatcher::new(Router::rules_only()).register(Arc::new(handler));
    let command = RemediationCommand::os_reconfig(ResourceType::Memory, json!(1024)).unwrap();

    let outcome = dispatcher.dispatch(&command, &RequestContext::new());
    assert!(!outcome.success());
    assert!(outcome.error_message().unwrap().contains("root"));
    assert!(runner.calls().is_empty());
}

#[test]
fn test_unregistered_agent_reports_error() {
    let dispatcher = Dispatcher::new(Router::rules_only());
    let command = RemediationCommand::config_change("Startup", "globals", "1").unwrap();

    let outcome = dispatcher.dispatch(&command, &RequestContext::new());
    assert!(!outcome.success());
    assert!(outcome.response.is_none());
    assert!(outcome.error_message().unwrap().contains("no handler registered"));
}
