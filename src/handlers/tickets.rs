use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handlers::{
    issue_context, manages, parse_event_id, parse_ticket_code, Caller, ListQuery, Pagination,
};
use crate::models::{
    Cancellation, EventId, GeoPoint, IssueContext, ScanEvent, Ticket, TicketCode, TicketStatus,
    TicketType, UserId,
};
use crate::state::AppState;
use crate::tickets::qr::render_data_uri;
use crate::tickets::{BulkIssue, BulkItemIssue, BulkSummary, IssueRequest};
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

/// A ticket as shown to its holder and to organizers. The encrypted metadata copy stays
/// server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketView {
    pub ticket_code: TicketCode,
    pub event_id: EventId,
    pub user_id: UserId,
    pub status: TicketStatus,
    pub ticket_type: TicketType,
    pub seat_number: Option<String>,
    pub special_access: Vec<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub scanned_by: Option<UserId>,
    pub scan_location: Option<GeoPoint>,
    pub last_validated: Option<DateTime<Utc>>,
    pub validation_count: u32,
    pub qr_payload: String,
    pub issue_context: IssueContext,
    pub cancellation: Option<Cancellation>,
}

impl From<Ticket> for TicketView {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_code: ticket.ticket_code,
            event_id: ticket.event_id,
            user_id: ticket.user_id,
            status: ticket.status,
            ticket_type: ticket.ticket_type,
            seat_number: ticket.seat_number,
            special_access: ticket.special_access,
            valid_from: ticket.valid_from,
            valid_until: ticket.valid_until,
            issued_at: ticket.issued_at,
            scanned_at: ticket.scanned_at,
            scanned_by: ticket.scanned_by,
            scan_location: ticket.scan_location,
            last_validated: ticket.last_validated,
            validation_count: ticket.validation_count,
            qr_payload: ticket.qr_payload,
            issue_context: ticket.issue_context,
            cancellation: ticket.cancellation,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketWithQr {
    #[serde(flatten)]
    pub ticket: TicketView,
    pub qr_code_image: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDetail {
    #[serde(flatten)]
    pub ticket: TicketView,
    pub scan_history: Vec<ScanEvent>,
    pub is_currently_valid: bool,
    pub time_remaining_secs: i64,
}

/// Renders off the async workers; PNG encoding is CPU-bound.
async fn render_qr(payload: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || render_data_uri(&payload))
        .await
        .map_err(|e| AppError::InternalServerError(format!("QR render task failed: {e}")))?
        .map_err(|e| AppError::InternalServerError(e.to_string()))
}

async fn with_qr(ticket: Ticket) -> Result<TicketWithQr, AppError> {
    let qr_code_image = render_qr(ticket.qr_payload.clone()).await?;
    Ok(TicketWithQr {
        ticket: TicketView::from(ticket),
        qr_code_image,
    })
}

/// Owner, organizer of the ticket's event, or admin.
async fn authorize_ticket_access(
    state: &AppState,
    caller: &Caller,
    ticket: &Ticket,
) -> Result<(), AppError> {
    if ticket.user_id == caller.id() || caller.0.is_admin() {
        return Ok(());
    }
    let event = state.collaborators.event(ticket.event_id).await?;
    if manages(&caller.0, &event) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Not allowed to access this ticket".to_string(),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueBody {
    pub user_id: Option<UserId>,
    pub ticket_type: Option<TicketType>,
    pub seat_number: Option<String>,
    pub special_access: Option<Vec<String>>,
}

pub async fn issue_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<IssueBody>>,
) -> Result<Response, AppError> {
    let event_id = parse_event_id(&event_id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let holder = body.user_id.unwrap_or_else(|| caller.id());
    if holder != caller.id() {
        let event = state.collaborators.event(event_id).await?;
        if !manages(&caller.0, &event) {
            return Err(AppError::Forbidden(
                "Only organizers can issue tickets for other users".to_string(),
            ));
        }
    }

    let issued = state
        .issuance
        .issue(IssueRequest {
            ticket_type: body.ticket_type.unwrap_or_default(),
            seat_number: body.seat_number,
            special_access: body.special_access.unwrap_or_default(),
            context: issue_context(&headers),
            ..IssueRequest::new(event_id, holder)
        })
        .await?;

    let view = with_qr(issued.ticket).await?;
    if issued.created {
        Ok(created(view, "Ticket generated successfully"))
    } else {
        Ok(success(view, "Ticket already exists for this event"))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketList {
    pub tickets: Vec<TicketView>,
    pub pagination: Pagination,
}

pub async fn list_my_tickets(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let paged = state
        .reports
        .for_user(caller.id(), &query.filter()?, query.page())
        .await?;
    let pagination = Pagination::from(&paged);
    let list = TicketList {
        tickets: paged.items.into_iter().map(TicketView::from).collect(),
        pagination,
    };
    Ok(success(list, "Tickets retrieved successfully"))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    let code = parse_ticket_code(&code)?;
    let ticket = state.lifecycle.find(&code).await?;
    authorize_ticket_access(&state, &caller, &ticket).await?;

    let now = state.clock.now();
    let detail = TicketDetail {
        is_currently_valid: ticket.is_currently_valid(now),
        time_remaining_secs: ticket.time_remaining(now).num_seconds(),
        scan_history: ticket.scan_history.iter().cloned().collect(),
        ticket: TicketView::from(ticket),
    };
    Ok(success(detail, "Ticket retrieved successfully"))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

pub async fn cancel_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Response, AppError> {
    let code = parse_ticket_code(&code)?;
    let ticket = state.lifecycle.find(&code).await?;
    authorize_ticket_access(&state, &caller, &ticket).await?;

    let reason = body.and_then(|Json(b)| b.reason);
    let cancelled = state.lifecycle.cancel(&code, reason).await?;
    Ok(success(
        TicketView::from(cancelled),
        "Ticket cancelled successfully",
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegeneratedTicket {
    pub ticket_code: TicketCode,
    pub qr_payload: String,
    pub qr_code_image: String,
    pub regenerated_at: Option<DateTime<Utc>>,
    pub valid_until: DateTime<Utc>,
}

pub async fn regenerate_ticket(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    let code = parse_ticket_code(&code)?;
    let ticket = state.lifecycle.find(&code).await?;
    if ticket.user_id != caller.id() {
        return Err(AppError::Forbidden(
            "Only the ticket holder can regenerate it".to_string(),
        ));
    }

    let (ticket, payload) = state.lifecycle.regenerate(&code).await?;
    let regenerated = RegeneratedTicket {
        qr_code_image: render_qr(ticket.qr_payload.clone()).await?,
        ticket_code: ticket.ticket_code,
        qr_payload: ticket.qr_payload,
        regenerated_at: payload.regenerated,
        valid_until: ticket.valid_until,
    };
    Ok(success(regenerated, "QR code regenerated successfully"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIssueBody {
    pub user_ids: Vec<UserId>,
    pub ticket_type: Option<TicketType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIssued {
    pub ticket_code: TicketCode,
    pub user_id: UserId,
    pub status: TicketStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIssueResult {
    pub succeeded: Vec<BulkIssued>,
    pub skipped: Vec<BulkItemIssue>,
    pub failed: Vec<BulkItemIssue>,
    pub summary: BulkSummary,
}

pub async fn bulk_issue(
    State(state): State<AppState>,
    caller: Caller,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BulkIssueBody>,
) -> Result<Response, AppError> {
    let event_id = parse_event_id(&event_id)?;
    let event = state.collaborators.event(event_id).await?;
    if !manages(&caller.0, &event) {
        return Err(AppError::Forbidden(
            "Only organizers can bulk-issue tickets".to_string(),
        ));
    }

    let report = state
        .bulk
        .issue(BulkIssue {
            event_id,
            user_ids: body.user_ids,
            ticket_type: body.ticket_type.unwrap_or_default(),
            ip_address: issue_context(&headers).ip_address,
        })
        .await?;

    let message = format!(
        "Bulk generation finished: {} issued, {} skipped, {} failed",
        report.summary.success, report.summary.skipped, report.summary.failed
    );
    let result = BulkIssueResult {
        succeeded: report
            .succeeded
            .into_iter()
            .map(|t| BulkIssued {
                ticket_code: t.ticket_code,
                user_id: t.user_id,
                status: t.status,
            })
            .collect(),
        skipped: report.skipped,
        failed: report.failed,
        summary: report.summary,
    };
    Ok(success(result, message))
}
