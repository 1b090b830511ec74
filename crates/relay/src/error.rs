//! Relay protocol errors and their HTTP mapping (spec §6, §7, §7a).
//!
//! Relay protocol errors never propagate as panics or generic 500s beyond
//! what's documented — each variant carries its own status code and a single
//! `error` string in the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("key pair proof failed")]
    InvalidKeyPair,
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("unknown recipient")]
    UnknownRecipient,
    #[error("recipient not connected")]
    RecipientNotOpen,
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::MissingField(_) | RelayError::InvalidKeyPair => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::UnknownRecipient => StatusCode::NOT_FOUND,
            RelayError::RecipientNotOpen => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DeliveryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
