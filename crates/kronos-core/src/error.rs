use thiserror::Error;

/// Maximum length for upstream response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors raised by the worker and its collaborators.
///
/// Every failure is scoped to the operation that raised it; none of these
/// tear down the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Precache fetch/store failure. Fatal to install.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Network fetch failure with no cached fallback.
    #[error("Network error: {0}")]
    Network(String),

    /// External provider returned an error or a malformed reply.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Unauthorised: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

impl WorkerError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Map a non-success provider status to an error.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => WorkerError::Auth(truncated),
            404 => WorkerError::NotFound(truncated),
            400 | 422 => WorkerError::Validation(truncated),
            _ => WorkerError::Upstream(format!("Status {}: {}", status, truncated)),
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            WorkerError::Upstream(err.to_string())
        } else {
            WorkerError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Upstream(format!("Malformed JSON: {}", err))
    }
}
