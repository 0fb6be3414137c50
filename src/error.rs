//! Request-path error taxonomy and its HTTP mapping.
//!
//! Startup failures use `anyhow` and abort the process; everything here is
//! per-request and maps onto a status code plus a single-line `text/plain`
//! body. Internal failures keep their detail in the logs and send a generic
//! body to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while admitting or fulfilling an issuance request.
#[derive(Debug, Error)]
pub enum IssueError {
    /// A peer certificate was presented but its fingerprint is not the
    /// broker's.
    #[error("Not authorized")]
    NotAuthorized,

    /// No peer certificate reached the handler, or it was unparsable.
    #[error("Invalid connection")]
    InvalidConnection,

    /// Request shape, parsing, signature, or identity-binding failure.
    #[error("{0}")]
    Validation(String),

    /// The request is well-formed but violates issuance policy.
    #[error("{0}")]
    Policy(String),

    /// Certificate construction or serialization failed.
    #[error("signing failure: {0}")]
    Signing(anyhow::Error),

    /// Key-tracking store failure.
    #[error("store failure: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for IssueError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            IssueError::NotAuthorized => {
                (StatusCode::UNAUTHORIZED, "Not authorized".to_string())
            }
            IssueError::InvalidConnection => {
                (StatusCode::BAD_REQUEST, "Invalid connection".to_string())
            }
            IssueError::Validation(msg) | IssueError::Policy(msg) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            IssueError::Signing(_) | IssueError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error".to_string(),
            ),
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_hide_detail() {
        let err = IssueError::Signing(anyhow::anyhow!("ec key rejected by backend"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = IssueError::Validation("invalid userIP".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn wrong_broker_maps_to_unauthorized() {
        let response = IssueError::NotAuthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
