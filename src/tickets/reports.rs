use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    AttendanceSnapshot, EventId, GeoPoint, ScanType, StatusCounts, Ticket, TicketCode,
    TicketStatus, UserId,
};
use crate::store::{Page, Paged, TicketFilter, TicketStore};
use crate::tickets::attendance::AttendanceAggregator;
use crate::tickets::error::TicketError;

const DASHBOARD_RECENT_SCANS: usize = 10;

/// Latest scan of one ticket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentScan {
    pub ticket_code: TicketCode,
    pub user_id: UserId,
    pub status: TicketStatus,
    pub scan_type: Option<ScanType>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub scanned_by: Option<UserId>,
    pub location: Option<GeoPoint>,
    pub validation_count: u32,
}

impl From<&Ticket> for RecentScan {
    fn from(ticket: &Ticket) -> Self {
        let latest = ticket.scan_history.latest();
        Self {
            ticket_code: ticket.ticket_code.clone(),
            user_id: ticket.user_id,
            status: ticket.status,
            scan_type: latest.map(|s| s.scan_type),
            scanned_at: latest.map(|s| s.scanned_at).or(ticket.scanned_at),
            scanned_by: latest.map(|s| s.scanned_by).or(ticket.scanned_by),
            location: latest
                .and_then(|s| s.location.clone())
                .or_else(|| ticket.scan_location.clone()),
            validation_count: ticket.validation_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceDashboard {
    pub attendance: AttendanceSnapshot,
    pub statuses: StatusCounts,
    pub recent_scans: Vec<RecentScan>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScans {
    pub tickets: Paged<Ticket>,
    pub statuses: StatusCounts,
}

/// Read-only views over tickets and attendance.
#[derive(Clone)]
pub struct TicketReports {
    tickets: Arc<dyn TicketStore>,
    attendance: AttendanceAggregator,
}

impl TicketReports {
    pub fn new(tickets: Arc<dyn TicketStore>, attendance: AttendanceAggregator) -> Self {
        Self {
            tickets,
            attendance,
        }
    }

    pub async fn for_user(
        &self,
        user: UserId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, TicketError> {
        Ok(self.tickets.list_for_user(user, filter, page).await?)
    }

    pub async fn event_scans(
        &self,
        event: EventId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<EventScans, TicketError> {
        let (tickets, statuses) = futures::try_join!(
            self.tickets.list_for_event(event, filter, page),
            self.tickets.status_counts(event),
        )?;
        Ok(EventScans { tickets, statuses })
    }

    pub async fn dashboard(&self, event: EventId) -> Result<AttendanceDashboard, TicketError> {
        let (statuses, recent) = futures::try_join!(
            self.tickets.status_counts(event),
            self.tickets.recent_scans(event, DASHBOARD_RECENT_SCANS),
        )?;
        let attendance = self.attendance.snapshot(event).await?;
        Ok(AttendanceDashboard {
            attendance,
            statuses,
            recent_scans: recent.iter().map(RecentScan::from).collect(),
        })
    }
}
