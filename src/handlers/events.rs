use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Serialize;

use crate::handlers::{manages, parse_event_id, Caller, ListQuery, Pagination};
use crate::models::{EventSummary, StatusCounts};
use crate::state::AppState;
use crate::tickets::{AttendanceDashboard, RecentScan};
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub event: EventSummary,
    #[serde(flatten)]
    pub dashboard: AttendanceDashboard,
}

pub async fn attendance_dashboard(
    State(state): State<AppState>,
    caller: Caller,
    Path(event_id): Path<String>,
) -> Result<Response, AppError> {
    let event_id = parse_event_id(&event_id)?;
    let event = state.collaborators.event(event_id).await?;
    if !manages(&caller.0, &event) {
        return Err(AppError::Forbidden(
            "Only organizers can view attendance".to_string(),
        ));
    }

    let dashboard = state.reports.dashboard(event_id).await?;
    let view = DashboardView {
        event: EventSummary::from(&event),
        dashboard,
    };
    Ok(success(view, "Attendance retrieved successfully"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanList {
    pub tickets: Vec<RecentScan>,
    pub statuses: StatusCounts,
    pub pagination: Pagination,
}

/// Scan log of one event. Open to its organizers and to scanners on its allow-list.
pub async fn event_scans(
    State(state): State<AppState>,
    caller: Caller,
    Path(event_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let event_id = parse_event_id(&event_id)?;
    let event = state.collaborators.event(event_id).await?;
    let listed_scanner = event
        .scan_policy
        .allowed_scanners
        .as_ref()
        .is_some_and(|allowed| allowed.contains(&caller.id()));
    if !manages(&caller.0, &event) && !listed_scanner {
        return Err(AppError::Forbidden(
            "Not allowed to view scans for this event".to_string(),
        ));
    }

    let filter = query.filter()?;
    let scans = state
        .reports
        .event_scans(event_id, &filter, query.page())
        .await?;
    let pagination = Pagination::from(&scans.tickets);
    let list = ScanList {
        tickets: scans.tickets.items.iter().map(RecentScan::from).collect(),
        statuses: scans.statuses,
        pagination,
    };
    Ok(success(list, "Scans retrieved successfully"))
}
