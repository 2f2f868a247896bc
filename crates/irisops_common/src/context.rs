//! Per-request context
//!
//! Every dispatched command gets a trace id that shows up on each log line of
//! its routing and handling, and in the audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub trace_id: Uuid,
    /// Groups the requests of one batch run (e.g. `irisopsctl process`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            workflow_id: None,
            started_at: Utc::now(),
        }
    }

    pub fn for_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::new()
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    pub fn span(&self) -> Span {
        match self.workflow_id {
            Some(workflow_id) => tracing::info_span!(
                "request",
                trace_id = %self.trace_id,
                workflow_id = %workflow_id
            ),
            None => tracing::info_span!("request", trace_id = %self.trace_id),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_get_distinct_trace_ids() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.trace_id, b.trace_id);
        assert!(a.workflow_id.is_none());
    }

    #[test]
    fn test_workflow_context_shares_workflow_id() {
        let workflow = Uuid::new_v4();
        let a = RequestContext::for_workflow(workflow);
        let b = RequestContext::for_workflow(workflow);
        assert_eq!(a.workflow_id, b.workflow_id);
        assert_ne!(a.trace_id, b.trace_id);
        assert!(a.elapsed_ms() >= 0);
    }
}
