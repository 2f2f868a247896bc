//! Terminal output
//!
//! Text renderers return strings so tests can inspect them; the `print_*`
//! helpers write to stdout. With `--json` every command prints one JSON
//! document per result instead.

use irisops_common::errorlog::GeneratedError;
use irisops_common::handlers::{ConfigResult, ResourceResult, RestartResult};
use irisops_common::sender::SendOutcome;
use irisops_common::{DispatchOutcome, HandlerResponse, IntakeResponse, OpsError, RoutingDecision};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::fmt::Write;

const KEY_WIDTH: usize = 20;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report an error that ended the command
pub fn display_error(err: &anyhow::Error, json: bool) {
    if json {
        let (code, kind) = match err.downcast_ref::<OpsError>() {
            Some(ops) => (ops.code(), ops.kind()),
            None => (1, "general"),
        };
        let body = serde_json::json!({
            "error": { "code": code, "kind": kind, "message": format!("{:#}", err) }
        });
        println!("{}", body);
    } else {
        eprintln!("[ERROR] {}", format!("{:#}", err).red());
    }
}

fn status_tag(success: bool) -> String {
    if success {
        "[OK]".green().to_string()
    } else {
        "[FAILED]".red().to_string()
    }
}

fn kv(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "  {:width$} {}", key, value, width = KEY_WIDTH);
}

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn render_decision(decision: &RoutingDecision) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "[ROUTING]".bold());
    kv(&mut out, "agent", decision.agent_type.cyan());
    kv(&mut out, "risk", decision.estimated_risk);
    kv(&mut out, "requires_validation", decision.requires_validation);
    kv(&mut out, "source", format!("{:?}", decision.source).to_lowercase());
    kv(&mut out, "rationale", &decision.rationale);
    out
}

pub fn render_intake(line: usize, response: &IntakeResponse) -> String {
    match response {
        IntakeResponse::Accepted {
            id,
            queue_position,
            has_conflict,
            conflicts_with,
        } => {
            let conflict = match (has_conflict, conflicts_with) {
                (true, Some(other)) => format!(" (conflicts with {})", other).yellow().to_string(),
                (true, None) => " (conflict)".yellow().to_string(),
                _ => String::new(),
            };
            format!("line {}: accepted {} at position {}{}", line, id, queue_position, conflict)
        }
        IntakeResponse::Rejected { error } => {
            format!("line {}: {} {}", line, "rejected".red(), error)
        }
    }
}

fn render_config(out: &mut String, r: &ConfigResult) {
    kv(out, "setting", format!("[{}] {}", r.section, r.key));
    kv(out, "old_value", opt(r.old_value.as_deref()));
    kv(out, "new_value", &r.new_value);
    kv(out, "requires_restart", r.requires_restart);
    kv(out, "backup", opt(r.backup_path().map(|p| p.display())));
}

fn render_resource(out: &mut String, r: &ResourceResult) {
    kv(out, "resource", r.resource_type);
    kv(out, "target", &r.target_value);
    kv(out, "old_value", opt(r.old_value.as_ref()));
    kv(out, "new_value", opt(r.new_value.as_ref()));
    kv(out, "validation_passed", r.validation_passed);
}

fn render_restart(out: &mut String, r: &RestartResult) {
    kv(out, "mode", r.mode);
    kv(out, "status", format!("{:?}", r.operational_status).to_lowercase());
    kv(out, "connections_drained", r.connections_drained);
    kv(out, "shutdown_seconds", format!("{:.1}", r.shutdown_duration_seconds));
    kv(out, "startup_seconds", format!("{:.1}", r.startup_duration_seconds));
    let stages: Vec<String> = r.stages.iter().map(|s| format!("{:?}", s).to_lowercase()).collect();
    kv(out, "stages", stages.join(" > "));
}

pub fn render_outcome(outcome: &DispatchOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} {} on {}",
        status_tag(outcome.success()),
        outcome.action_type,
        outcome.command_id.dimmed(),
        outcome.target
    );
    kv(&mut out, "agent", outcome.decision.agent_type);
    kv(&mut out, "risk", outcome.decision.estimated_risk);

    match &outcome.response {
        Some(HandlerResponse::Config(r)) => render_config(&mut out, r),
        Some(HandlerResponse::Resource(r)) => render_resource(&mut out, r),
        Some(HandlerResponse::Restart(r)) => render_restart(&mut out, r),
        None => {}
    }

    if let Some(response) = &outcome.response {
        for op in response.operations() {
            let _ = writeln!(out, "    {} {}", "-".dimmed(), op);
        }
    }
    if let Some(error) = outcome.error_message() {
        kv(&mut out, "error", error.red());
    }
    out
}

pub fn render_generated(generated: &GeneratedError, delivery: Option<&SendOutcome>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", generated.message.to_log_format());
    let source = format!("{:?}", generated.source).to_lowercase();
    let _ = writeln!(out, "  {:width$} {}", "source", source.dimmed(), width = KEY_WIDTH);

    match delivery {
        Some(SendOutcome::Delivered { endpoint, response_code }) => {
            kv(&mut out, "delivered", format!("{} ({})", endpoint, response_code).green());
        }
        Some(SendOutcome::Failed { endpoint, response_code, .. }) => {
            kv(&mut out, "delivery", format!("{} answered {}, queued", endpoint, response_code).yellow());
        }
        Some(SendOutcome::Error { endpoint, error, .. }) => {
            kv(&mut out, "delivery", format!("{} unreachable: {}, queued", endpoint, error).red());
        }
        None => {}
    }
    out
}

pub fn print_outcome(outcome: &DispatchOutcome) {
    print!("{}", render_outcome(outcome));
}
