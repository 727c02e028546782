//! Response bodies produced by the admin surface.
//!
//! The admin handler serialises these as JSON; operators and monitors consume them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

/// Outcome of a single named health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// `true` when the check passed.
    pub healthy: bool,
    /// Optional detail: the check's message when healthy, the failure otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckResult {
    /// A passing result with no detail.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    /// A passing result carrying a message.
    pub fn healthy_with(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: Some(message.into()),
        }
    }

    /// A failing result carrying the reason.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Response body for `GET /healthcheck`, keyed by check name.
///
/// A `BTreeMap` keeps the output sorted so that repeated checks diff cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub checks: BTreeMap<String, HealthCheckResult>,
}

impl HealthResponse {
    /// `true` when every check passed. An empty set counts as healthy.
    pub fn all_healthy(&self) -> bool {
        self.checks.values().all(|r| r.healthy)
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Response body for `POST /tasks/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Name of the task that ran.
    pub task: String,
    /// Free-form output written by the task.
    pub output: String,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx admin status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"not_found"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_aggregates() {
        let mut resp = HealthResponse::default();
        assert!(resp.all_healthy());
        resp.checks.insert("deadlocks".into(), HealthCheckResult::healthy());
        resp.checks
            .insert("database".into(), HealthCheckResult::unhealthy("connection refused"));
        assert!(!resp.all_healthy());
    }

    #[test]
    fn healthy_result_omits_message() {
        let json = serde_json::to_string(&HealthCheckResult::healthy()).unwrap();
        assert_eq!(json, r#"{"healthy":true}"#);
    }

    #[test]
    fn error_response_from_service_error() {
        let err = crate::ServiceError::NotFound("task `gc`".into());
        let body = ErrorResponse::from(&err);
        assert_eq!(body.code, "not_found");
        assert!(body.message.contains("gc"));
    }
}
