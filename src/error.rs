use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced on the HTTP side of the front door.
///
/// In-band WS errors (`error{code,message,requestId?}`) are constructed
/// directly by the room actor and the protocol codec; they do not flow
/// through this type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("dev token issuer disabled")]
    DevIssuerDisabled,
    #[error("expected websocket upgrade")]
    ExpectedWebSocket,
    #[error("rate limited, retry at {reset_at}")]
    RateLimited { remaining: u32, reset_at: i64 },
    #[error("rate limiter unavailable")]
    RateLimiterUnavailable,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::DevIssuerDisabled => "DEV_ISSUER_DISABLED",
            AppError::ExpectedWebSocket => "EXPECTED_WEBSOCKET",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::RateLimiterUnavailable => "RATE_LIMIT_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::DevIssuerDisabled => StatusCode::FORBIDDEN,
            AppError::ExpectedWebSocket => StatusCode::UPGRADE_REQUIRED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::RateLimiterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let mut body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });

        if let AppError::RateLimited {
            remaining,
            reset_at,
        } = &self
        {
            body["rateLimit"] = json!({
                "remaining": remaining,
                "resetAt": reset_at,
            });
        }

        (status, Json(body)).into_response()
    }
}
