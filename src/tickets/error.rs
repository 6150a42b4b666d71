use thiserror::Error;

use crate::models::TicketCode;
use crate::store::StoreError;
use crate::tickets::integrity::CryptoError;
use crate::tickets::reason::ReasonCode;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("event not found")]
    EventNotFound,

    #[error("user is not registered for this event")]
    UserNotRegistered,

    #[error("ticket {0} not found")]
    TicketNotFound(TicketCode),

    #[error("could not mint a unique ticket code after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("event schedule yields an empty validity window")]
    InvalidValidityWindow,

    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch of {size} items exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("operation rejected: {0}")]
    Rejected(ReasonCode),

    #[error("{0} is unavailable")]
    DependencyUnavailable(String),

    #[error("crypto failure")]
    Crypto(#[from] CryptoError),

    #[error("storage failure")]
    Storage(#[source] StoreError),
}

impl TicketError {
    /// Stable code for per-item bulk results and error bodies.
    pub fn reason(&self) -> ReasonCode {
        match self {
            TicketError::EventNotFound => ReasonCode::EventNotFound,
            TicketError::UserNotRegistered => ReasonCode::UserNotRegistered,
            TicketError::TicketNotFound(_) => ReasonCode::TicketNotFound,
            TicketError::Rejected(reason) => *reason,
            TicketError::DependencyUnavailable(_) => ReasonCode::DependencyUnavailable,
            TicketError::EmptyBatch | TicketError::BatchTooLarge { .. } => {
                ReasonCode::InvalidFormat
            }
            TicketError::CodeGenerationExhausted { .. }
            | TicketError::InvalidValidityWindow
            | TicketError::Crypto(_)
            | TicketError::Storage(_) => ReasonCode::InternalError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TicketError::DependencyUnavailable(_) | TicketError::CodeGenerationExhausted { .. }
        )
    }
}

impl From<StoreError> for TicketError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            TicketError::DependencyUnavailable(err.to_string())
        } else {
            TicketError::Storage(err)
        }
    }
}
