//! CLI integration tests for irisopsctl
//!
//! Every test runs the real binary against a throwaway settings file and CPF:
//! - config-change   edits the CPF, keeps a backup, reports requires_restart
//! - route-command   rule table decisions, validation exit code
//! - process         JSONL intake through the worker pool
//! - generate-error  template fallback when the advisor is off

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const CPF: &str = "[ConfigFile]\nVersion=2024.1\n\n[Startup]\nglobals=10000\n\n[Miscellaneous]\nEnableLongStrings=0\n";

struct Fixture {
    dir: TempDir,
    config: PathBuf,
    cpf: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cpf = dir.path().join("iris.cpf");
        fs::write(&cpf, CPF).unwrap();
        let config = dir.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "[instance]\ncpf_path = \"{}\"\n\n[audit]\npath = \"{}\"\n\n[logging]\nlevel = \"error\"\n",
                cpf.display(),
                dir.path().join("audit.jsonl").display()
            ),
        )
        .unwrap();
        Self { dir, config, cpf }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_irisopsctl"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("IRISOPS_CONFIG")
            .env_remove("IRIS_CPF_PATH")
            .env_remove("IRIS_INSTANCE_NAME")
            .env_remove("LOG_LEVEL")
            .env_remove("LOG_FORMAT")
            .output()
            .expect("failed to run irisopsctl")
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout))
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_irisopsctl"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["generate-error", "route-command", "config-change", "os-reconfig", "restart", "process"] {
        assert!(stdout.contains(name), "missing {} in help", name);
    }
}

#[test]
fn test_config_change_updates_cpf() {
    let fx = Fixture::new();
    let output = fx.run(&[
        "config-change",
        "--section",
        "Startup",
        "--key",
        "globals",
        "--value",
        "20000",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let body = stdout_json(&output);
    assert_eq!(body["decision"]["agent_type"], "config");
    assert_eq!(body["response"]["kind"], "config");
    assert_eq!(body["response"]["success"], true);
    assert_eq!(body["response"]["old_value"], "10000");
    assert_eq!(body["response"]["new_value"], "20000");
    assert_eq!(body["response"]["requires_restart"], true);
    assert!(body["response"]["backup"].is_object());

    let cpf = fs::read_to_string(&fx.cpf).unwrap();
    assert!(cpf.contains("globals=20000"));

    let audit = fs::read_to_string(fx.dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(audit.lines().count(), 1);
}

#[test]
fn test_config_change_without_cpf_fails_cleanly() {
    let fx = Fixture::new();
    let missing = fx.dir.path().join("absent.cpf");
    let output = fx.run(&[
        "config-change",
        "--section",
        "Startup",
        "--key",
        "globals",
        "--value",
        "1",
        "--cpf-path",
        path_arg(&missing),
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let body = stdout_json(&output);
    assert_eq!(body["response"]["success"], false);
    assert!(!missing.exists());
    assert_eq!(fs::read_to_string(&fx.cpf).unwrap(), CPF);
}

#[test]
fn test_route_command_by_flags() {
    let fx = Fixture::new();
    let output = fx.run(&[
        "route-command",
        "--action",
        "restart",
        "--target",
        "instance",
        "--parameters",
        r#"{"mode":"graceful"}"#,
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let body = stdout_json(&output);
    assert_eq!(body["agent_type"], "restart");
    assert_eq!(body["estimated_risk"], "high");
    assert_eq!(body["requires_validation"], true);
}

#[test]
fn test_route_command_from_file() {
    let fx = Fixture::new();
    let file = fx.write(
        "cmd.json",
        r#"{"action_type":"os_reconfig","target":"memory","parameters":{"resource_type":"memory","target_value":2048}}"#,
    );
    let output = fx.run(&["route-command", "--file", path_arg(&file), "--json"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["agent_type"], "os");
}

#[test]
fn test_route_command_unknown_action_is_validation_error() {
    let fx = Fixture::new();
    let output = fx.run(&["route-command", "--action", "reboot_host", "--target", "x", "--json"]);
    assert_eq!(output.status.code(), Some(65));
    let body = stdout_json(&output);
    assert_eq!(body["error"]["kind"], "validation");
    assert!(body["error"]["message"].as_str().unwrap().contains("reboot_host"));
}

#[test]
fn test_route_command_parameters_must_be_object() {
    let fx = Fixture::new();
    let output = fx.run(&[
        "route-command",
        "--action",
        "restart",
        "--target",
        "instance",
        "--parameters",
        "[1,2]",
    ]);
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn test_process_runs_queue_and_reports_rejections() {
    let fx = Fixture::new();
    let file = fx.write(
        "commands.jsonl",
        concat!(
            r#"{"action_type":"config_change","target":"iris.cpf","parameters":{"section":"Miscellaneous","key":"EnableLongStrings","value":"1"},"priority":"low"}"#,
            "\n",
            "# comment lines are skipped\n",
            "\n",
            r#"{"action_type":"config_change","target":"iris.cpf","parameters":{"section":"Startup","key":"globals","value":"30000"},"priority":"critical"}"#,
            "\n",
            r#"{"action_type":"config_change","target":"iris.cpf","parameters":{"section":"Startup"}}"#,
            "\n",
        ),
    );

    let output = fx.run(&["process", "--file", path_arg(&file), "--json"]);
    assert_eq!(output.status.code(), Some(1));

    let body = stdout_json(&output);
    let intake = body["intake"].as_array().unwrap();
    assert_eq!(intake.len(), 3);
    assert_eq!(intake[0]["line"], 1);
    assert_eq!(intake[0]["status"], "accepted");
    assert_eq!(intake[1]["line"], 4);
    assert_eq!(intake[2]["status"], "rejected");

    let outcomes = body["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o["response"]["success"] == true));
    assert!(outcomes.iter().all(|o| o["workflow_id"] == body["workflow_id"]));

    let cpf = fs::read_to_string(&fx.cpf).unwrap();
    assert!(cpf.contains("globals=30000"));
    assert!(cpf.contains("EnableLongStrings=1"));
}

#[test]
fn test_process_missing_file() {
    let fx = Fixture::new();
    let output = fx.run(&["process", "--file", "/nonexistent/commands.jsonl"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot read command file"));
}

#[test]
fn test_generate_error_from_template() {
    let fx = Fixture::new();
    let output = fx.run(&["generate-error", "--category", "journal", "--severity", "3", "--json"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let body = stdout_json(&output);
    assert_eq!(body["source"], "template");
    assert_eq!(body["message"]["severity"], 3);
    assert!(body["delivery"].is_null());
    let line = body["log_format"].as_str().unwrap();
    assert!(line.contains(" 3 [WriteDaemon] "), "{}", line);
}
