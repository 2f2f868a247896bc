//! Command routing
//!
//! The rule table is authoritative: every action type maps to exactly one
//! handler and a baseline risk. An advisor, when configured, may contribute a
//! rationale and raise the risk, but it can never pick a different handler or
//! lower the risk. Any advisor failure falls back to the rule decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::advisor::{call_with_retry, Advisor, AdvisorError, RetryPolicy};
use crate::command::RemediationCommand;

/// Which handler executes a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Config,
    Os,
    Restart,
    None,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Os => "os",
            Self::Restart => "restart",
            Self::None => "none",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk levels, ordered from least to most risky
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Rules,
    Advisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingRule {
    pub agent: AgentType,
    pub risk: RiskLevel,
}

/// Rule table lookup on the raw action string
pub fn rule_for(action_type: &str) -> RoutingRule {
    let (agent, risk) = match action_type {
        "config_change" => (AgentType::Config, RiskLevel::Medium),
        "os_reconfig" => (AgentType::Os, RiskLevel::High),
        "restart" => (AgentType::Restart, RiskLevel::High),
        _ => (AgentType::None, RiskLevel::Medium),
    };
    RoutingRule { agent, risk }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agent_type: AgentType,
    pub rationale: String,
    pub requires_validation: bool,
    pub estimated_risk: RiskLevel,
    pub source: DecisionSource,
    /// The command as routed, serialized
    pub command_str: String,
}

impl RoutingDecision {
    /// Deterministic decision from the rule table
    pub fn from_rules(action_type: &str, command_str: impl Into<String>) -> Self {
        let rule = rule_for(action_type);
        Self {
            agent_type: rule.agent,
            rationale: format!(
                "Rule-based routing: {} maps to {} agent",
                action_type, rule.agent
            ),
            requires_validation: rule.risk != RiskLevel::Low,
            estimated_risk: rule.risk,
            source: DecisionSource::Rules,
            command_str: command_str.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdvisorVerdict {
    agent_type: AgentType,
    rationale: String,
    estimated_risk: RiskLevel,
}

const ROUTING_SYSTEM_PROMPT: &str = "You route remediation commands for an InterSystems IRIS \
database instance to the handler that executes them.\n\
Handlers:\n\
- config: edits the CPF configuration file (config_change)\n\
- os: reconfigures OS resources such as huge pages or CPU (os_reconfig)\n\
- restart: drains, stops and starts the instance (restart)\n\
Assess how risky the command is for a production system and explain why in one or two sentences.";

const ROUTING_SCHEMA: &str = r#"{
  "agent_type": "config" | "os" | "restart" | "none",
  "rationale": "string",
  "requires_validation": true | false,
  "estimated_risk": "low" | "medium" | "high"
}"#;

/// Routes commands with the rule table, optionally enriched by an advisor
pub struct Router {
    advisor: Option<Arc<dyn Advisor>>,
    retry: RetryPolicy,
}

impl Router {
    pub fn rules_only() -> Self {
        Self {
            advisor: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_advisor(advisor: Arc<dyn Advisor>, retry: RetryPolicy) -> Self {
        Self {
            advisor: Some(advisor),
            retry,
        }
    }

    pub fn route(&self, command: &RemediationCommand) -> RoutingDecision {
        let command_str = command
            .to_json()
            .unwrap_or_else(|_| command.id().to_string());
        let baseline = RoutingDecision::from_rules(command.action_type().as_str(), command_str);

        let Some(advisor) = self.advisor.as_deref() else {
            return baseline;
        };

        match self.consult(advisor, &baseline) {
            Ok(decision) => {
                debug!(
                    command_id = %command.id(),
                    agent = %decision.agent_type,
                    risk = %decision.estimated_risk,
                    "Advisor routing accepted"
                );
                decision
            }
            Err(e) => {
                warn!(
                    command_id = %command.id(),
                    error = %e,
                    "Advisor routing unavailable, falling back to rules"
                );
                baseline
            }
        }
    }

    fn consult(
        &self,
        advisor: &dyn Advisor,
        baseline: &RoutingDecision,
    ) -> Result<RoutingDecision, AdvisorError> {
        let user_prompt = format!("Route this remediation command:\n{}", baseline.command_str);

        call_with_retry(
            advisor,
            &self.retry,
            "route_command",
            (ROUTING_SYSTEM_PROMPT, user_prompt.as_str(), ROUTING_SCHEMA),
            |value: Value| accept_verdict(value, baseline),
        )
    }
}

fn accept_verdict(value: Value, baseline: &RoutingDecision) -> Result<RoutingDecision, AdvisorError> {
    let verdict: AdvisorVerdict = serde_json::from_value(value)
        .map_err(|e| AdvisorError::InvalidJson(format!("routing verdict: {}", e)))?;

    if verdict.agent_type != baseline.agent_type {
        return Err(AdvisorError::Rejected(format!(
            "advisor chose {} agent, rules require {}",
            verdict.agent_type, baseline.agent_type
        )));
    }
    let rationale = verdict.rationale.trim();
    if rationale.is_empty() {
        return Err(AdvisorError::Rejected("empty rationale".to_string()));
    }

    let estimated_risk = verdict.estimated_risk.max(baseline.estimated_risk);
    Ok(RoutingDecision {
        agent_type: baseline.agent_type,
        rationale: rationale.to_string(),
        requires_validation: estimated_risk != RiskLevel::Low,
        estimated_risk,
        source: DecisionSource::Advisor,
        command_str: baseline.command_str.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::FakeAdvisor;
    use crate::command::{ResourceType, RestartMode};
    use serde_json::json;

    fn config_command() -> RemediationCommand {
        RemediationCommand::config_change("Startup", "globals", "20000").unwrap()
    }

    #[test]
    fn test_rule_table() {
        assert_eq!(rule_for("config_change").agent, AgentType::Config);
        assert_eq!(rule_for("config_change").risk, RiskLevel::Medium);
        assert_eq!(rule_for("os_reconfig").agent, AgentType::Os);
        assert_eq!(rule_for("os_reconfig").risk, RiskLevel::High);
        assert_eq!(rule_for("restart").agent, AgentType::Restart);
        assert_eq!(rule_for("restart").risk, RiskLevel::High);
        assert_eq!(rule_for("defragment").agent, AgentType::None);
        assert_eq!(rule_for("defragment").risk, RiskLevel::Medium);
    }

    #[test]
    fn test_unknown_action_still_needs_validation() {
        let decision = RoutingDecision::from_rules("defragment", "{}");
        assert_eq!(decision.agent_type, AgentType::None);
        assert_eq!(decision.estimated_risk, RiskLevel::Medium);
        assert!(decision.requires_validation);
    }

    #[test]
    fn test_rules_only_routing() {
        let router = Router::rules_only();
        let decision = router.route(&config_command());
        assert_eq!(decision.agent_type, AgentType::Config);
        assert_eq!(decision.source, DecisionSource::Rules);
        assert!(decision.requires_validation);
        assert_eq!(
            decision.rationale,
            "Rule-based routing: config_change maps to config agent"
        );

        let restart = router.route(&RemediationCommand::restart(RestartMode::Forced, 30).unwrap());
        assert_eq!(restart.agent_type, AgentType::Restart);
        let os = router.route(&RemediationCommand::os_reconfig(ResourceType::Memory, json!(512)).unwrap());
        assert_eq!(os.agent_type, AgentType::Os);
        assert_eq!(os.estimated_risk, RiskLevel::High);
    }

    #[test]
    fn test_advisor_rationale_and_risk_raise_accepted() {
        let advisor = Arc::new(FakeAdvisor::always_valid(json!({
            "agent_type": "config",
            "rationale": "Raising globals on a live system needs a restart window",
            "requires_validation": true,
            "estimated_risk": "high"
        })));
        let router = Router::with_advisor(advisor, RetryPolicy::no_delay(1));

        let decision = router.route(&config_command());
        assert_eq!(decision.source, DecisionSource::Advisor);
        assert_eq!(decision.agent_type, AgentType::Config);
        assert_eq!(decision.estimated_risk, RiskLevel::High);
        assert!(decision.rationale.contains("restart window"));
    }

    #[test]
    fn test_advisor_cannot_lower_risk() {
        let advisor = Arc::new(FakeAdvisor::always_valid(json!({
            "agent_type": "restart",
            "rationale": "Routine restart",
            "requires_validation": false,
            "estimated_risk": "low"
        })));
        let router = Router::with_advisor(advisor, RetryPolicy::no_delay(1));

        let decision = router.route(&RemediationCommand::restart(RestartMode::Graceful, 60).unwrap());
        assert_eq!(decision.estimated_risk, RiskLevel::High);
        assert!(decision.requires_validation);
    }

    #[test]
    fn test_advisor_disagreeing_on_agent_falls_back() {
        let advisor = Arc::new(FakeAdvisor::always_valid(json!({
            "agent_type": "os",
            "rationale": "Looks like a memory problem",
            "requires_validation": true,
            "estimated_risk": "high"
        })));
        let router = Router::with_advisor(advisor.clone(), RetryPolicy::no_delay(2));

        let decision = router.route(&config_command());
        assert_eq!(decision.source, DecisionSource::Rules);
        assert_eq!(decision.agent_type, AgentType::Config);
        assert_eq!(advisor.call_count(), 2);
    }

    #[test]
    fn test_advisor_garbage_falls_back() {
        let advisor = Arc::new(FakeAdvisor::always_valid(json!({"answer": 42})));
        let router = Router::with_advisor(advisor, RetryPolicy::no_delay(1));
        assert_eq!(router.route(&config_command()).source, DecisionSource::Rules);
    }

    #[test]
    fn test_advisor_error_falls_back() {
        let advisor = Arc::new(FakeAdvisor::always_error(AdvisorError::Timeout(30)));
        let router = Router::with_advisor(advisor, RetryPolicy::no_delay(3));
        let command = config_command();
        assert_eq!(router.route(&command), Router::rules_only().route(&command));
    }

    #[test]
    fn test_command_str_carries_command() {
        let command = config_command();
        let decision = Router::rules_only().route(&command);
        let parsed = RemediationCommand::from_json(&decision.command_str).unwrap();
        assert_eq!(parsed.id(), command.id());
    }
}
