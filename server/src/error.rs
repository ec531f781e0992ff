//! Error types for tiergate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors raised while admitting and serving a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid tier {tier}: expected a value in 0..{tiers}")]
    InvalidTier { tier: i64, tiers: usize },

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::InvalidTier { .. } => (StatusCode::BAD_REQUEST, "invalid_tier"),
            Error::EngineFailure(_) => (StatusCode::BAD_GATEWAY, "engine_failure"),
            // Nobody is left to read this one; the status is only for logs.
            Error::ClientDisconnected => (StatusCode::BAD_REQUEST, "client_disconnected"),
            Error::PersistenceFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "persistence_failure")
            }
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::PersistenceFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_tier_maps_to_bad_request() {
        let response = Error::InvalidTier { tier: 7, tiers: 4 }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_engine_failure_maps_to_bad_gateway() {
        let response = Error::EngineFailure("boom".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::InvalidTier { tier: -1, tiers: 4 }.to_string(),
            "Invalid tier -1: expected a value in 0..4"
        );
        assert_eq!(Error::ClientDisconnected.to_string(), "Client disconnected");
    }
}
