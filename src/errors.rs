use actix_web::HttpResponse;
use thiserror::Error;

use crate::domain::errors::OutboxError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found")]
    NotFound,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<OutboxError> for AppError {
    fn from(e: OutboxError) -> Self {
        match e {
            OutboxError::EventNotFound(_) => AppError::NotFound,
            OutboxError::NotInitialized | OutboxError::Pool(_) | OutboxError::Context(_) => {
                AppError::Unavailable(e.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl actix_web::ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::NotFound => HttpResponse::NotFound().json(serde_json::json!({
                "error": self.to_string()
            })),
            AppError::Unavailable(_) => {
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "Outbox store unavailable"
                }))
            }
            AppError::Internal(_) => HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error"
            })),
        }
    }
}
