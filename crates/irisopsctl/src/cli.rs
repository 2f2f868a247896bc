//! Command line definition

use clap::{Args, Parser, Subcommand, ValueEnum};
use irisops_common::errorlog::{ErrorCategory, Severity};
use irisops_common::{Priority, ResourceType, RestartMode};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "irisopsctl")]
#[command(about = "IrisOps - remediation agent for InterSystems IRIS", long_about = None)]
#[command(version = irisops_common::VERSION)]
pub struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Settings file (default: $IRISOPS_CONFIG, then /etc/irisops/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a realistic IRIS error message
    GenerateError {
        #[arg(long, value_enum)]
        category: CategoryArg,

        /// 0=info, 1=warning, 2=error, 3=fatal
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
        severity: u8,

        /// Extra scenario detail for the advisor
        #[arg(long, default_value = "")]
        context: String,

        /// messages.log file with real entries to imitate
        #[arg(long, value_name = "PATH")]
        log_samples: Option<PathBuf>,

        /// Also deliver the message to the configured endpoint
        #[arg(long)]
        send: bool,
    },

    /// Show which handler a command would go to, without running it
    RouteCommand(RouteArgs),

    /// Change one CPF setting
    ConfigChange {
        #[arg(long)]
        section: String,

        #[arg(long)]
        key: String,

        #[arg(long)]
        value: String,

        /// Override the CPF file from settings
        #[arg(long, value_name = "PATH")]
        cpf_path: Option<PathBuf>,
    },

    /// Reconfigure an OS resource
    OsReconfig {
        #[arg(long, value_enum)]
        resource: ResourceArg,

        /// Megabytes for memory; core count or JSON object for cpu
        #[arg(long)]
        value: String,
    },

    /// Restart the IRIS instance
    Restart {
        #[arg(long, value_enum, default_value_t = ModeArg::Graceful)]
        mode: ModeArg,

        /// Total time budget in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Override the instance name from settings
        #[arg(long)]
        instance: Option<String>,

        /// Skip the confirmation for forced restarts
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Queue every command of a JSONL file and run them through the worker pool
    Process {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RouteArgs {
    /// JSON file holding one command
    #[arg(long, value_name = "PATH", conflicts_with_all = ["action", "target", "parameters"])]
    pub file: Option<PathBuf>,

    #[arg(long, required_unless_present = "file")]
    pub action: Option<String>,

    #[arg(long, required_unless_present = "file")]
    pub target: Option<String>,

    /// Parameters as a JSON object
    #[arg(long)]
    pub parameters: Option<String>,

    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    pub priority: PriorityArg,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CategoryArg {
    License,
    Config,
    Os,
    Journal,
}

impl From<CategoryArg> for ErrorCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::License => ErrorCategory::License,
            CategoryArg::Config => ErrorCategory::Config,
            CategoryArg::Os => ErrorCategory::Os,
            CategoryArg::Journal => ErrorCategory::Journal,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceArg {
    Memory,
    Cpu,
}

impl From<ResourceArg> for ResourceType {
    fn from(arg: ResourceArg) -> Self {
        match arg {
            ResourceArg::Memory => ResourceType::Memory,
            ResourceArg::Cpu => ResourceType::Cpu,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Graceful,
    Forced,
}

impl From<ModeArg> for RestartMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Graceful => RestartMode::Graceful,
            ModeArg::Forced => RestartMode::Forced,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorityArg {
    Critical,
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Critical => Priority::Critical,
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

/// Severity argument, already range-checked by clap
pub fn severity(value: u8) -> Severity {
    Severity::try_from(value).unwrap_or_default()
}
