use std::fmt;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Machine-readable outcome codes. The serialized strings are a public contract consumed by
/// scanner apps and dashboards; never rename a variant's wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    ScanSuccess,
    InvalidFormat,
    TicketNotFound,
    IntegrityCheckFailed,
    ScannerNotAuthorized,
    #[serde(rename = "TICKET_TOO_EARLY")]
    TooEarly,
    #[serde(rename = "TICKET_EXPIRED")]
    Expired,
    TicketInactive,
    LocationInvalid,
    LocationMissing,
    #[serde(rename = "TICKET_ALREADY_USED")]
    AlreadyUsed,
    TicketAlreadyCancelled,
    TicketAlreadyExists,
    UserNotRegistered,
    EventNotFound,
    DependencyUnavailable,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ScanSuccess => "SCAN_SUCCESS",
            ReasonCode::InvalidFormat => "INVALID_FORMAT",
            ReasonCode::TicketNotFound => "TICKET_NOT_FOUND",
            ReasonCode::IntegrityCheckFailed => "INTEGRITY_CHECK_FAILED",
            ReasonCode::ScannerNotAuthorized => "SCANNER_NOT_AUTHORIZED",
            ReasonCode::TooEarly => "TICKET_TOO_EARLY",
            ReasonCode::Expired => "TICKET_EXPIRED",
            ReasonCode::TicketInactive => "TICKET_INACTIVE",
            ReasonCode::LocationInvalid => "LOCATION_INVALID",
            ReasonCode::LocationMissing => "LOCATION_MISSING",
            ReasonCode::AlreadyUsed => "TICKET_ALREADY_USED",
            ReasonCode::TicketAlreadyCancelled => "TICKET_ALREADY_CANCELLED",
            ReasonCode::TicketAlreadyExists => "TICKET_ALREADY_EXISTS",
            ReasonCode::UserNotRegistered => "USER_NOT_REGISTERED",
            ReasonCode::EventNotFound => "EVENT_NOT_FOUND",
            ReasonCode::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ReasonCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Operator-facing default text. Clients should localize from the code instead.
    pub fn message(&self) -> &'static str {
        match self {
            ReasonCode::ScanSuccess => "Ticket scan successful",
            ReasonCode::InvalidFormat => "Invalid QR code format",
            ReasonCode::TicketNotFound => "Ticket not found",
            ReasonCode::IntegrityCheckFailed => "QR code verification failed",
            ReasonCode::ScannerNotAuthorized => "Scanner is not authorized for this event",
            ReasonCode::TooEarly => "Ticket is not yet valid",
            ReasonCode::Expired => "Ticket has expired",
            ReasonCode::TicketInactive => "Ticket is not active",
            ReasonCode::LocationInvalid => "Scan location is outside the venue area",
            ReasonCode::LocationMissing => "Scan location is required for this event",
            ReasonCode::AlreadyUsed => "Ticket has already been used",
            ReasonCode::TicketAlreadyCancelled => "Ticket is already cancelled",
            ReasonCode::TicketAlreadyExists => "Ticket already exists for this user and event",
            ReasonCode::UserNotRegistered => "User is not registered for this event",
            ReasonCode::EventNotFound => "Event not found",
            ReasonCode::DependencyUnavailable => "A required service is unavailable, retry later",
            ReasonCode::InternalError => "Internal error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ReasonCode::ScanSuccess => StatusCode::OK,
            ReasonCode::TicketNotFound | ReasonCode::EventNotFound => StatusCode::NOT_FOUND,
            ReasonCode::ScannerNotAuthorized | ReasonCode::UserNotRegistered => {
                StatusCode::FORBIDDEN
            }
            ReasonCode::AlreadyUsed
            | ReasonCode::TicketInactive
            | ReasonCode::TicketAlreadyCancelled
            | ReasonCode::TicketAlreadyExists => StatusCode::CONFLICT,
            ReasonCode::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ReasonCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ReasonCode::InvalidFormat
            | ReasonCode::IntegrityCheckFailed
            | ReasonCode::TooEarly
            | ReasonCode::Expired
            | ReasonCode::LocationInvalid
            | ReasonCode::LocationMissing => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
