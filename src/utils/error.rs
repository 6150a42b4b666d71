use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::tickets::{ReasonCode, TicketError};
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A ticket-domain refusal carrying its stable reason code.
    #[error("Rejected: {0}")]
    Rejected(ReasonCode),

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Rejected(reason) => reason.status_code(),
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Rejected(reason) => reason.as_str(),
            AppError::Unavailable(_) => ReasonCode::DependencyUnavailable.as_str(),
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(msg)
            | AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg) => {
                info!(code = self.code(), message = %msg, "Request refused");
            }
            AppError::Rejected(reason) => {
                info!(code = reason.as_str(), "Request rejected");
            }
            AppError::Unavailable(msg) => {
                warn!(message = %msg, "Dependency unavailable");
            }
            AppError::InternalServerError(msg) => {
                error!(message = %msg, "Application error");
            }
        }
    }
}

impl From<TicketError> for AppError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::EventNotFound => AppError::Rejected(ReasonCode::EventNotFound),
            TicketError::UserNotRegistered => AppError::Rejected(ReasonCode::UserNotRegistered),
            TicketError::TicketNotFound(_) => AppError::Rejected(ReasonCode::TicketNotFound),
            TicketError::Rejected(reason) => AppError::Rejected(reason),
            TicketError::EmptyBatch | TicketError::BatchTooLarge { .. } => {
                AppError::ValidationError(err.to_string())
            }
            TicketError::DependencyUnavailable(_) | TicketError::CodeGenerationExhausted { .. } => {
                AppError::Unavailable(err.to_string())
            }
            TicketError::InvalidValidityWindow
            | TicketError::Crypto(_)
            | TicketError::Storage(_) => AppError::InternalServerError(format!("{err:?}")),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        self.log();

        // Only expose high-level message to the client
        let public_message = match &self {
            AppError::ValidationError(msg)
            | AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg) => msg.clone(),
            AppError::Rejected(reason) => reason.message().to_string(),
            AppError::Unavailable(_) => ReasonCode::DependencyUnavailable.message().to_string(),
            AppError::InternalServerError(_) => "An internal error occurred".to_string(),
        };

        let details = match &self {
            AppError::Unavailable(_) => Some(json!({ "retryable": true })),
            _ => None,
        };

        error_response(code, public_message, details, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TicketCode;

    #[test]
    fn test_ticket_errors_map_to_reason_codes() {
        let code = TicketCode::parse("CP-loyw3v28-0A1B2C3D").unwrap();
        let err = AppError::from(TicketError::TicketNotFound(code));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "TICKET_NOT_FOUND");

        let err = AppError::from(TicketError::Rejected(ReasonCode::AlreadyUsed));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "TICKET_ALREADY_USED");
    }

    #[test]
    fn test_dependency_failures_are_503() {
        let err = AppError::from(TicketError::DependencyUnavailable("event directory".into()));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "DEPENDENCY_UNAVAILABLE");
    }

    #[test]
    fn test_oversized_batch_is_a_validation_error() {
        let err = AppError::from(TicketError::BatchTooLarge { size: 101, max: 100 });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
