//! Outbound message delivery
//!
//! POSTs error messages to the configured collector. A message that cannot
//! be delivered (transport error or non-2xx answer) is kept in memory and
//! can be resent with `retry_queued`.

use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::errorlog::{ErrorMessage, Severity};
use crate::settings::SenderSettings;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

/// Wire payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub timestamp: String,
    pub process_id: u32,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub log_format: String,
}

impl From<&ErrorMessage> for OutboundMessage {
    fn from(msg: &ErrorMessage) -> Self {
        Self {
            timestamp: msg.timestamp().to_string(),
            process_id: msg.process_id(),
            severity: msg.severity(),
            category: msg.category().to_string(),
            message: msg.message_text().to_string(),
            log_format: msg.to_log_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered {
        endpoint: String,
        response_code: u16,
    },
    /// The collector answered with a non-2xx status
    Failed {
        endpoint: String,
        response_code: u16,
        queued: bool,
    },
    /// No answer at all
    Error {
        endpoint: String,
        error: String,
        queued: bool,
    },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub success_count: usize,
    pub failed_count: usize,
    pub remaining_queue: usize,
}

pub struct MessageSender {
    endpoint: String,
    client: reqwest::blocking::Client,
    pending: Mutex<Vec<ErrorMessage>>,
}

impl MessageSender {
    pub fn new(settings: &SenderSettings) -> Result<Self, SendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SendError::Client(e.to_string()))?;

        Ok(Self {
            endpoint: settings.endpoint.clone(),
            client,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one message, queueing it on failure
    pub fn send(&self, message: &ErrorMessage) -> SendOutcome {
        let outcome = self.post(message);
        if !outcome.is_delivered() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.clone());
        }
        outcome
    }

    pub fn queue_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Resend everything queued; failures stay queued, once each
    pub fn retry_queued(&self) -> RetrySummary {
        let queued = mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if queued.is_empty() {
            return RetrySummary::default();
        }
        info!(queued = queued.len(), "Retrying queued messages");

        let mut summary = RetrySummary::default();
        let mut still_failing = Vec::new();
        for message in queued {
            if self.post(&message).is_delivered() {
                summary.success_count += 1;
            } else {
                summary.failed_count += 1;
                still_failing.push(message);
            }
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // Keep original order ahead of anything sent while retrying
        still_failing.append(&mut pending);
        *pending = still_failing;
        summary.remaining_queue = pending.len();

        info!(
            success = summary.success_count,
            failed = summary.failed_count,
            remaining = summary.remaining_queue,
            "Retry finished"
        );
        summary
    }

    fn post(&self, message: &ErrorMessage) -> SendOutcome {
        let payload = OutboundMessage::from(message);
        info!(
            endpoint = %self.endpoint,
            severity = %payload.severity,
            category = %payload.category,
            "Sending message"
        );

        match self.client.post(&self.endpoint).json(&payload).send() {
            Ok(response) if response.status().is_success() => {
                info!(endpoint = %self.endpoint, status = response.status().as_u16(), "Message delivered");
                SendOutcome::Delivered {
                    endpoint: self.endpoint.clone(),
                    response_code: response.status().as_u16(),
                }
            }
            Ok(response) => {
                warn!(endpoint = %self.endpoint, status = response.status().as_u16(), "Collector refused message, queued");
                SendOutcome::Failed {
                    endpoint: self.endpoint.clone(),
                    response_code: response.status().as_u16(),
                    queued: true,
                }
            }
            Err(e) => {
                error!(endpoint = %self.endpoint, error = %e, "Message delivery failed, queued");
                SendOutcome::Error {
                    endpoint: self.endpoint.clone(),
                    error: e.to_string(),
                    queued: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ErrorMessage {
        ErrorMessage::new(
            "02/06/26-14:30:45:123",
            12345,
            Severity::Error,
            "[Utility.Event]",
            "LMF Error: No valid license key. No valid local file found.",
        )
        .unwrap()
    }

    fn unreachable_sender() -> MessageSender {
        MessageSender::new(&SenderSettings {
            endpoint: "http://127.0.0.1:9/api/messages".to_string(),
            timeout_secs: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_payload_shape() {
        let payload = serde_json::to_value(OutboundMessage::from(&message())).unwrap();
        assert_eq!(payload["process_id"], 12345);
        assert_eq!(payload["severity"], 2);
        assert_eq!(payload["category"], "[Utility.Event]");
        assert_eq!(
            payload["log_format"],
            "02/06/26-14:30:45:123 (12345) 2 [Utility.Event] LMF Error: No valid license key. No valid local file found."
        );
    }

    #[test]
    fn test_unreachable_endpoint_queues() {
        let sender = unreachable_sender();
        let outcome = sender.send(&message());

        assert!(matches!(outcome, SendOutcome::Error { queued: true, .. }));
        assert_eq!(sender.queue_len(), 1);
    }

    #[test]
    fn test_retry_keeps_failures_once() {
        let sender = unreachable_sender();
        sender.send(&message());
        sender.send(&message());

        let summary = sender.retry_queued();
        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.remaining_queue, 2);
        assert_eq!(sender.queue_len(), 2);
    }

    #[test]
    fn test_retry_with_empty_queue() {
        assert_eq!(unreachable_sender().retry_queued(), RetrySummary::default());
    }
}
