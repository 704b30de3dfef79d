use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use coursegate_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Conflict
                | EngineError::AlreadyUnlocked(_)
                | EngineError::NotEligible(_) => StatusCode::CONFLICT,
                EngineError::Locked(_) => StatusCode::LOCKED,
                EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Engine(EngineError::InsufficientFunds { balance, cost }) => {
                serde_json::json!({
                    "error": self.to_string(),
                    "balance": balance,
                    "cost": cost,
                })
            }
            ApiError::Engine(EngineError::StoreUnavailable(detail)) => {
                tracing::error!(error = %detail, "store unavailable");
                serde_json::json!({ "error": "Service temporarily unavailable" })
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                serde_json::json!({ "error": "Internal server error" })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, axum::Json(body)).into_response()
    }
}
