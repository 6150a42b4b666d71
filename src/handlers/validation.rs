use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handlers::Caller;
use crate::models::{
    AttendanceSnapshot, EventSummary, GeoPoint, ScanEvent, ScanType, TicketSummary, UserId,
    UserSummary,
};
use crate::state::AppState;
use crate::tickets::{
    BulkValidate, ReasonCode, ScanInput, ScanOutcome, ScanRejection, ScanRequest,
};
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateBody {
    pub qr_payload: Option<String>,
    #[serde(default)]
    pub scan_type: ScanType,
    pub location: Option<GeoPoint>,
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Body of `POST /tickets/validate`. Scanner apps branch on `reasonCode`, never on `message`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub outcome: Outcome,
    pub reason_code: ReasonCode,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance: Option<AttendanceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<UserId>,
}

impl From<ScanOutcome> for ValidationResult {
    fn from(outcome: ScanOutcome) -> Self {
        let reason = outcome.reason();
        match outcome {
            ScanOutcome::Admitted(receipt) => Self {
                outcome: Outcome::Success,
                reason_code: reason,
                message: reason.message(),
                ticket: Some(receipt.ticket),
                user: receipt.user,
                event: Some(receipt.event),
                scan: Some(receipt.scan),
                attendance: receipt.attendance,
                used_at: None,
                used_by: None,
            },
            ScanOutcome::Rejected(rejection) => Self {
                outcome: Outcome::Failure,
                reason_code: reason,
                message: reason.message(),
                ticket: rejection.ticket,
                user: None,
                event: None,
                scan: None,
                attendance: None,
                used_at: rejection.used_at,
                used_by: rejection.used_by,
            },
        }
    }
}

impl IntoResponse for ValidationResult {
    fn into_response(self) -> Response {
        let status = match self.outcome {
            Outcome::Success => StatusCode::OK,
            Outcome::Failure => self.reason_code.status_code(),
        };
        (status, Json(self)).into_response()
    }
}

pub async fn validate_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<ValidateBody>,
) -> Result<ValidationResult, AppError> {
    let Some(qr_payload) = body.qr_payload.filter(|p| !p.trim().is_empty()) else {
        return Ok(ValidationResult::from(ScanOutcome::Rejected(
            ScanRejection::bare(ReasonCode::InvalidFormat),
        )));
    };

    let outcome = state
        .validation
        .validate(ScanRequest {
            input: ScanInput::Payload(qr_payload),
            scanner: caller.id(),
            scan_type: body.scan_type,
            location: body.location,
            device_info: body.device_info,
        })
        .await?;
    Ok(ValidationResult::from(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkValidateBody {
    pub ticket_codes: Vec<String>,
    #[serde(default)]
    pub scan_type: ScanType,
    pub location: Option<GeoPoint>,
    pub device_info: Option<serde_json::Value>,
}

pub async fn bulk_validate(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<BulkValidateBody>,
) -> Result<Response, AppError> {
    let report = state
        .bulk
        .validate(BulkValidate {
            items: body.ticket_codes,
            scanner: caller.id(),
            scan_type: body.scan_type,
            location: body.location,
            device_info: body.device_info,
        })
        .await?;

    let message = format!(
        "Bulk validation finished: {} admitted, {} skipped, {} failed",
        report.summary.success, report.summary.skipped, report.summary.failed
    );
    Ok(success(report, message))
}
