//! Subcommand implementations
//!
//! Each command returns the process exit code. Operations that ran and failed
//! are reported normally and exit with `EXIT_GENERAL_ERROR`; errors returned
//! from here are problems that stopped the command before it could run.

use anyhow::{Context, Result};
use irisops_common::advisor::{HttpAdvisor, RetryPolicy};
use irisops_common::command::CommandPayload;
use irisops_common::errorlog::{ErrorCategory, ErrorGenerator, LogParser, Severity};
use irisops_common::sender::MessageSender;
use irisops_common::{
    logging, worker, CommandQueue, Dispatcher, IntakeResponse, OpsError, Priority, RemediationCommand,
    RequestContext, ResourceType, RestartMode, Settings,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::{self, Cli, Commands, RouteArgs};
use crate::errors::{exit_code_for_success, EXIT_CANCELLED, EXIT_GENERAL_ERROR, EXIT_SUCCESS};
use crate::output::{self, print_json};

/// Load settings, start logging and run the selected command
pub fn run(cli: Cli) -> Result<i32> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    logging::init(&settings.logging);
    for problem in settings.validate() {
        warn!(problem = %problem, "Settings problem");
    }

    let json = cli.json;
    match cli.command {
        Commands::GenerateError {
            category,
            severity,
            context,
            log_samples,
            send,
        } => generate_error(
            &settings,
            json,
            category.into(),
            cli::severity(severity),
            &context,
            log_samples.as_deref(),
            send,
        ),
        Commands::RouteCommand(args) => route_command(&settings, json, args),
        Commands::ConfigChange {
            section,
            key,
            value,
            cpf_path,
        } => {
            if let Some(path) = cpf_path {
                settings.instance.cpf_path = path;
            }
            let command = RemediationCommand::config_change(section, key, value)?;
            execute(&settings, json, command)
        }
        Commands::OsReconfig { resource, value } => {
            let command = RemediationCommand::os_reconfig(resource.into(), parse_target_value(&value))?;
            execute(&settings, json, command)
        }
        Commands::Restart {
            mode,
            timeout,
            instance,
            yes,
        } => {
            if let Some(name) = instance {
                settings.instance.name = name;
            }
            let mode = RestartMode::from(mode);
            if mode == RestartMode::Forced && !yes {
                let prompt = format!(
                    "Forced restart of {} drops in-flight work. Continue? [y/N] ",
                    settings.instance.name
                );
                if !confirm(&prompt, &mut io::stdin().lock())? {
                    eprintln!("Cancelled");
                    return Ok(EXIT_CANCELLED);
                }
            }
            let command = RemediationCommand::restart(mode, timeout)?;
            execute(&settings, json, command)
        }
        Commands::Process { file } => process(&settings, json, &file),
    }
}

/// Ask on stderr, read the answer from `input`. Anything but y/yes declines.
pub fn confirm(prompt: &str, input: &mut impl BufRead) -> io::Result<bool> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// `1024` is a number, `{"cores": 4}` an object, anything else stays a string
pub fn parse_target_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_result<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        print_json(value)
    } else {
        print!("{}", text());
        Ok(())
    }
}

fn execute(settings: &Settings, json: bool, command: RemediationCommand) -> Result<i32> {
    let dispatcher = Dispatcher::from_settings(settings)?;
    let outcome = dispatcher.dispatch(&command, &RequestContext::new());
    print_result(json, &outcome, || output::render_outcome(&outcome))?;
    Ok(exit_code_for_success(outcome.success()))
}

fn route_command(settings: &Settings, json: bool, args: RouteArgs) -> Result<i32> {
    let command = match &args.file {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("cannot read command file {}", path.display()))?;
            RemediationCommand::from_json(content.trim())?
        }
        None => {
            let parameters = match args.parameters.as_deref() {
                Some(raw) => match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => map,
                    _ => return Err(OpsError::validation("--parameters must be a JSON object").into()),
                },
                None => Map::new(),
            };
            let payload = CommandPayload {
                command_id: None,
                action_type: args.action.clone().unwrap_or_default(),
                target: args.target.clone().unwrap_or_default(),
                parameters,
                priority: Some(Priority::from(args.priority).as_str().to_string()),
                requester: Some("irisopsctl".to_string()),
                created_at: None,
            };
            RemediationCommand::try_from(payload)?
        }
    };

    let dispatcher = Dispatcher::from_settings(settings)?;
    let decision = dispatcher.route(&command);
    print_result(json, &decision, || output::render_decision(&decision))?;
    Ok(EXIT_SUCCESS)
}

fn generate_error(
    settings: &Settings,
    json: bool,
    category: ErrorCategory,
    severity: Severity,
    context: &str,
    log_samples: Option<&Path>,
    send: bool,
) -> Result<i32> {
    let samples = log_samples.map(LogParser::from_file).unwrap_or_default();
    let mut generator = ErrorGenerator::new(samples);
    let advisor = HttpAdvisor::from_settings(&settings.advisor)
        .map_err(|e| OpsError::Settings(format!("advisor: {}", e)))?;
    if let Some(advisor) = advisor {
        generator = generator.with_advisor(advisor, RetryPolicy::from_settings(&settings.advisor));
    }

    let generated = generator.generate(category, severity, context);
    let delivery = if send {
        let sender = MessageSender::new(&settings.sender).map_err(OpsError::from)?;
        Some(sender.send(&generated.message))
    } else {
        None
    };

    let body = serde_json::json!({
        "message": generated.message,
        "log_format": generated.message.to_log_format(),
        "source": generated.source,
        "delivery": delivery,
    });
    print_result(json, &body, || output::render_generated(&generated, delivery.as_ref()))?;

    Ok(exit_code_for_success(delivery.map_or(true, |d| d.is_delivered())))
}

#[derive(Serialize)]
struct IntakeLine {
    line: usize,
    #[serde(flatten)]
    response: IntakeResponse,
}

fn process(settings: &Settings, json: bool, file: &Path) -> Result<i32> {
    let content =
        fs::read_to_string(file).with_context(|| format!("cannot read command file {}", file.display()))?;

    let mut queue = CommandQueue::new();
    let mut intake = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        intake.push(IntakeLine {
            line: index + 1,
            response: queue.receive(trimmed),
        });
    }
    let rejected = intake.iter().filter(|i| !i.response.is_accepted()).count();
    info!(accepted = queue.len(), rejected, "Command file loaded");

    if !json {
        for entry in &intake {
            println!("{}", output::render_intake(entry.line, &entry.response));
        }
        println!();
    }

    // The advisor's blocking HTTP client must not be dropped inside the runtime,
    // so this reference outlives `block_on`.
    let dispatcher = Arc::new(Dispatcher::from_settings(settings)?);
    let workflow_id = Uuid::new_v4();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start worker runtime")?;
    let outcomes = runtime.block_on(worker::run_pool(
        Arc::new(Mutex::new(queue)),
        dispatcher.clone(),
        settings.worker.pool_size,
        Some(workflow_id),
    ));
    drop(runtime);
    drop(dispatcher);

    if json {
        print_json(&serde_json::json!({
            "workflow_id": workflow_id,
            "intake": intake,
            "outcomes": outcomes,
        }))?;
    } else {
        for outcome in &outcomes {
            output::print_outcome(outcome);
        }
    }

    let failed = outcomes.iter().filter(|o| !o.success()).count();
    if rejected > 0 || failed > 0 {
        Ok(EXIT_GENERAL_ERROR)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
