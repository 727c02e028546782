//! Common error types shared across crates.

use thiserror::Error;

/// Error surfaced by the admin endpoints.
///
/// Variants map to HTTP status codes returned to callers:
/// - [`ServiceError::BadRequest`] → 400
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::TaskFailed`] → 500
/// - [`ServiceError::Unavailable`] → 503
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed, e.g. a task parameter could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No task or resource is registered under the requested name.
    #[error("not found: {0}")]
    NotFound(String),

    /// A registered task ran and returned an error.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The server is at its request limit or shutting down.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::TaskFailed(_) => 500,
            ServiceError::Unavailable(_) => 503,
        }
    }

    /// Short machine-readable code used in [`crate::protocol::ErrorResponse`].
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::TaskFailed(_) => "task_failed",
            ServiceError::Unavailable(_) => "service_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(ServiceError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(ServiceError::NotFound("x".into()).http_status(), 404);
        assert_eq!(ServiceError::TaskFailed("x".into()).http_status(), 500);
        assert_eq!(ServiceError::Unavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn display_includes_message() {
        let e = ServiceError::NotFound("task `flush-cache`".into());
        assert!(e.to_string().contains("flush-cache"));
        assert_eq!(e.code(), "not_found");
    }
}
