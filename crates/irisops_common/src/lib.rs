//! IrisOps core: remediation commands for an InterSystems IRIS instance.
//!
//! Commands enter a priority queue, get routed to a handler (CPF edits, OS
//! resources, restarts) and every outcome is reported as a structured result.

pub mod advisor;
pub mod audit;
pub mod command;
pub mod context;
pub mod cpf;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod handlers;
pub mod instance;
pub mod logging;
pub mod privilege;
pub mod queue;
pub mod router;
pub mod settings;
pub mod worker;

// Error log simulation and delivery
pub mod errorlog;
pub mod sender;

pub use command::{ActionParams, ActionType, Priority, RemediationCommand, ResourceType, RestartMode, TargetValue};
pub use context::RequestContext;
pub use cpf::{BackupRef, ConfigStore, StoreError};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{OpsError, OpsResult};
pub use handlers::{Handler, HandlerResponse};
pub use queue::{CommandQueue, IntakeResponse, QueueStatus};
pub use router::{AgentType, RiskLevel, Router, RoutingDecision};
pub use settings::Settings;

/// System-wide settings file
pub const CONFIG_PATH: &str = settings::SYSTEM_CONFIG_PATH;

/// Crate version, shown by `irisopsctl --version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
