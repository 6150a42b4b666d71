use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::models::{UserId, UserSummary};
use crate::state::AppState;
use crate::utils::error::AppError;

/// Header carrying the authenticated user's id, set by the session layer in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, resolved through the user directory.
#[derive(Debug, Clone)]
pub struct Caller(pub UserSummary);

impl Caller {
    pub fn id(&self) -> UserId {
        self.0.id
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::AuthError("Missing x-user-id header".to_string()))?;

        let id: UserId = raw
            .trim()
            .parse()
            .map_err(|_| AppError::AuthError("Malformed user id".to_string()))?;

        let user = state
            .collaborators
            .user(id)
            .await?
            .ok_or_else(|| AppError::AuthError("Unknown user".to_string()))?;

        Ok(Caller(user))
    }
}
