//! Error types for the controller binary.
//!
//! [`ConfigError`] is fatal at startup. [`AppError`] maps lookups on the
//! status server into JSON responses with a machine-readable `error` field and
//! a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keeper_core::error::InvalidDuration;
use serde::Serialize;

/// Invalid startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration setting did not parse.
    #[error("{setting}: {source}")]
    Duration {
        setting: &'static str,
        #[source]
        source: InvalidDuration,
    },

    /// The unseal threshold cannot be met by the share count.
    #[error("threshold {threshold} must be between 1 and shares ({shares})")]
    Threshold { shares: u8, threshold: u8 },

    /// A setting has a value outside its allowed range.
    #[error("{setting} is invalid: {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },

    /// The cluster service address is not a usable URL.
    #[error("cluster address '{address}' is invalid: {reason}")]
    Address { address: String, reason: String },
}

/// Error returned from status handlers.
#[derive(Debug)]
pub enum AppError {
    /// No status row with that name.
    NotFound(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}
