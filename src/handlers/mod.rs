use axum::http::{header, HeaderMap};
use axum::response::Response;
use serde::{Deserialize, Serialize};

use crate::models::{EventId, EventInfo, IssueContext, TicketCode, TicketStatus, UserSummary};
use crate::store::{Page, Paged, TicketFilter};
use crate::utils::error::AppError;
use crate::utils::response::success;

pub mod caller;
pub mod events;
pub mod tickets;
pub mod validation;

pub use caller::Caller;

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "campus-tickets",
    };

    success(payload, "Health check successful")
}

/// Query string shared by the listing endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
    pub event_id: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListQuery {
    pub fn filter(&self) -> Result<TicketFilter, AppError> {
        let status = self
            .status
            .as_deref()
            .map(|s| s.parse::<TicketStatus>())
            .transpose()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        let event_id = self.event_id.as_deref().map(parse_event_id).transpose()?;
        Ok(TicketFilter { status, event_id })
    }

    pub fn page(&self) -> Page {
        let default = Page::default();
        Page::new(
            self.page.unwrap_or(default.page),
            self.limit.unwrap_or(default.limit),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

impl<T> From<&Paged<T>> for Pagination {
    fn from(paged: &Paged<T>) -> Self {
        Self {
            page: paged.page,
            limit: paged.limit,
            total: paged.total,
            pages: paged.pages(),
        }
    }
}

pub fn parse_event_id(raw: &str) -> Result<EventId, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::ValidationError(format!("'{raw}' is not a valid event id")))
}

pub fn parse_ticket_code(raw: &str) -> Result<TicketCode, AppError> {
    TicketCode::parse(raw.trim()).map_err(|e| AppError::ValidationError(e.to_string()))
}

/// Organizers of the event and admins may act on any of its tickets.
pub fn manages(caller: &UserSummary, event: &EventInfo) -> bool {
    caller.is_admin() || event.is_organized_by(caller.id)
}

/// Device fingerprint and client address of the issuing request.
pub fn issue_context(headers: &HeaderMap) -> IssueContext {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let ip_address = header_str("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_str("x-real-ip"));

    IssueContext {
        device_fingerprint: header_str(header::USER_AGENT.as_str()),
        ip_address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_issue_context_prefers_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("ScannerApp/2.1"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));

        let context = issue_context(&headers);
        assert_eq!(context.device_fingerprint.as_deref(), Some("ScannerApp/2.1"));
        assert_eq!(context.ip_address.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_list_query_rejects_unknown_status() {
        let query = ListQuery {
            status: Some("deleted".to_string()),
            ..ListQuery::default()
        };
        assert!(query.filter().is_err());
    }

    #[test]
    fn test_list_query_clamps_paging() {
        let query = ListQuery {
            page: Some(0),
            limit: Some(1000),
            ..ListQuery::default()
        };
        assert_eq!(query.page(), Page::new(1, 100));
    }
}
