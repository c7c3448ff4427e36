use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the admission-control subsystem.
///
/// Throttling is never an error: a rejected request is an ordinary
/// [`AdmissionResult`](crate::algorithms::AdmissionResult) with `allowed == false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Shared store error: {0}")]
    Store(String),

    #[error("Shared store timed out after {0} ms")]
    StoreTimeout(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures of the shared store, which the engine degrades on.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::StoreTimeout(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Policy(format!("invalid pattern: {}", err))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Store(_) | Error::StoreTimeout(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            Error::Configuration(_) => Self::new("configuration_error", &message, 500),
            Error::Validation(_) | Error::Policy(_) => {
                Self::new("validation_error", &message, 422)
            }
            Error::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
