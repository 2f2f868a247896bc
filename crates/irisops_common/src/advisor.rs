//! Advisory model client
//!
//! The advisor is an optional language-model backend consulted for routing
//! rationale and for synthetic error text. It is never authoritative: callers
//! validate whatever comes back and fall back to deterministic behaviour on
//! any error. Backends speak JSON in and JSON out through a single call.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::settings::AdvisorSettings;

/// Advisor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdvisorError {
    #[error("Advisor is disabled in configuration")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    #[error("Advisor returned empty response")]
    EmptyResponse,

    /// Output parsed but failed the caller's checks
    #[error("Advisor output rejected: {0}")]
    Rejected(String),
}

impl AdvisorError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Advisory backend
pub trait Advisor: Send + Sync {
    /// Call the model with a prompt and expect a JSON object back
    fn call_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_description: &str,
    ) -> Result<Value, AdvisorError>;
}

/// Retry budget for advisor calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before retry `n` is `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &AdvisorSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }

    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }
}

/// Call the advisor and validate its output, retrying with linear backoff.
///
/// `accept` turns the raw JSON into the caller's type; a rejection counts as a
/// failed attempt. `Disabled` is returned immediately.
pub fn call_with_retry<T>(
    advisor: &dyn Advisor,
    policy: &RetryPolicy,
    operation: &str,
    prompts: (&str, &str, &str),
    mut accept: impl FnMut(Value) -> Result<T, AdvisorError>,
) -> Result<T, AdvisorError> {
    let (system_prompt, user_prompt, schema) = prompts;
    let attempts = policy.max_attempts.max(1);
    let mut last_error = AdvisorError::EmptyResponse;

    for attempt in 1..=attempts {
        let result = advisor
            .call_json(system_prompt, user_prompt, schema)
            .and_then(&mut accept);

        match result {
            Ok(value) => {
                debug!(operation, attempt, "Advisor call succeeded");
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(operation, attempt, max_attempts = attempts, error = %err, "Advisor call failed");
                last_error = err;
                if attempt < attempts {
                    thread::sleep(policy.base_delay * attempt);
                }
            }
        }
    }

    Err(last_error)
}

// ============================================================================
// HTTP backend
// ============================================================================

/// OpenAI-compatible chat completions backend
pub struct HttpAdvisor {
    settings: AdvisorSettings,
    client: reqwest::blocking::Client,
}

impl HttpAdvisor {
    pub fn new(settings: AdvisorSettings) -> Result<Self, AdvisorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AdvisorError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { settings, client })
    }

    /// Shared advisor when enabled in settings, `None` otherwise
    pub fn from_settings(settings: &AdvisorSettings) -> Result<Option<Arc<dyn Advisor>>, AdvisorError> {
        if !settings.enabled {
            return Ok(None);
        }
        let advisor: Arc<dyn Advisor> = Arc::new(Self::new(settings.clone())?);
        Ok(Some(advisor))
    }
}

impl Advisor for HttpAdvisor {
    fn call_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_description: &str,
    ) -> Result<Value, AdvisorError> {
        if !self.settings.enabled {
            return Err(AdvisorError::Disabled);
        }

        let url = format!(
            "{}/v1/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        );
        let user_content = format!(
            "{}\n\nRespond with a single JSON object matching this schema:\n{}",
            user_prompt, schema_description
        );

        let request_body = serde_json::json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_content},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(api_key) = &self.settings.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                AdvisorError::Timeout(self.settings.timeout_secs)
            } else {
                AdvisorError::Http(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(AdvisorError::Http(format!(
                "HTTP {} from advisor endpoint",
                response.status()
            )));
        }

        let response_json: Value = response
            .json()
            .map_err(|e| AdvisorError::InvalidJson(format!("Failed to parse response: {}", e)))?;

        let text = response_json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or(AdvisorError::EmptyResponse)?;

        parse_model_json(text)
    }
}

/// Parse model text as JSON, tolerating a fenced code block around it
pub fn parse_model_json(text: &str) -> Result<Value, AdvisorError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if body.is_empty() {
        return Err(AdvisorError::EmptyResponse);
    }
    serde_json::from_str(body)
        .map_err(|e| AdvisorError::InvalidJson(format!("Advisor output is not valid JSON: {}", e)))
}

// ============================================================================
// Fake backend
// ============================================================================

/// Scripted advisor for tests
pub struct FakeAdvisor {
    responses: Mutex<Vec<Result<Value, AdvisorError>>>,
    call_count: Mutex<usize>,
}

impl FakeAdvisor {
    /// Responses are returned in order; the last one repeats
    pub fn new(responses: Vec<Result<Value, AdvisorError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
        }
    }

    pub fn always_valid(json: Value) -> Self {
        Self::new(vec![Ok(json)])
    }

    pub fn always_error(error: AdvisorError) -> Self {
        Self::new(vec![Err(error)])
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Advisor for FakeAdvisor {
    fn call_json(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _schema_description: &str,
    ) -> Result<Value, AdvisorError> {
        *self.call_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match responses.len() {
            0 => Err(AdvisorError::EmptyResponse),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }
}
