//! Scan-time decision pipeline.
//!
//! A scan runs parse, lookup, integrity, scanner authorization, time window, geofence and
//! reuse checks in that order and stops at the first failure. Only a scan that passes every
//! check reaches the commit, which is a compare-and-swap on the status the checks were run
//! against. When the swap loses a race the ticket is re-read and the checks run again, so of
//! N concurrent scans of an active ticket exactly one is admitted and the rest see
//! `TICKET_ALREADY_USED`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::models::{
    AttendanceSnapshot, EventInfo, EventSummary, GeoPoint, ScanCommit, ScanEvent, ScanType,
    StatusChange, Ticket, TicketCode, TicketStatus, TicketSummary, UserId, UserSummary,
};
use crate::store::TicketStore;
use crate::tickets::attendance::AttendanceAggregator;
use crate::tickets::error::TicketError;
use crate::tickets::integrity::{IntegrityGuard, QrPayload};
use crate::tickets::reason::ReasonCode;
use crate::tickets::{Collaborators, TicketSettings};
use crate::utils::clock::Clock;

/// Status moves at most twice (active, then used or cancelled or expired), so a scan needs at
/// most this many reads to observe a stable status.
const COMMIT_ATTEMPTS: usize = 3;

/// What the scanner read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanInput {
    /// The full QR text. Runs every check, including the integrity stamp.
    Payload(String),
    /// A ticket code typed by an operator. Skips the stamp check.
    Code(String),
}

impl ScanInput {
    /// QR payloads are JSON objects; anything else is taken as a typed code.
    pub fn detect(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.trim_start().starts_with('{') {
            ScanInput::Payload(raw)
        } else {
            ScanInput::Code(raw)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub input: ScanInput,
    pub scanner: UserId,
    pub scan_type: ScanType,
    pub location: Option<GeoPoint>,
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReceipt {
    pub ticket: TicketSummary,
    pub user: Option<UserSummary>,
    pub event: EventSummary,
    pub scan: ScanEvent,
    /// `None` only when the counter store failed after the scan was committed.
    pub attendance: Option<AttendanceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRejection {
    pub reason: ReasonCode,
    /// Withheld for lookup, integrity and authorization failures.
    pub ticket: Option<TicketSummary>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<UserId>,
}

impl ScanRejection {
    pub fn bare(reason: ReasonCode) -> Self {
        Self {
            reason,
            ticket: None,
            used_at: None,
            used_by: None,
        }
    }

    fn about(reason: ReasonCode, ticket: &Ticket) -> Self {
        Self {
            reason,
            ticket: Some(TicketSummary::from(ticket)),
            used_at: None,
            used_by: None,
        }
    }

    fn already_used(ticket: &Ticket) -> Self {
        Self {
            used_at: ticket.scanned_at,
            used_by: ticket.scanned_by,
            ..Self::about(ReasonCode::AlreadyUsed, ticket)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Admitted(Box<ScanReceipt>),
    Rejected(ScanRejection),
}

impl ScanOutcome {
    pub fn reason(&self) -> ReasonCode {
        match self {
            ScanOutcome::Admitted(_) => ReasonCode::ScanSuccess,
            ScanOutcome::Rejected(rejection) => rejection.reason,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, ScanOutcome::Admitted(_))
    }
}

#[derive(Clone)]
pub struct ValidationEngine {
    tickets: Arc<dyn TicketStore>,
    collaborators: Collaborators,
    guard: Arc<IntegrityGuard>,
    attendance: AttendanceAggregator,
    clock: Arc<dyn Clock>,
    settings: TicketSettings,
}

impl ValidationEngine {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        collaborators: Collaborators,
        guard: Arc<IntegrityGuard>,
        attendance: AttendanceAggregator,
        clock: Arc<dyn Clock>,
        settings: TicketSettings,
    ) -> Self {
        Self {
            tickets,
            collaborators,
            guard,
            attendance,
            clock,
            settings,
        }
    }

    /// Runs the scan pipeline. State failures come back as [`ScanOutcome::Rejected`]; `Err`
    /// is reserved for infrastructure failures, which never leave a partial commit behind.
    pub async fn validate(&self, request: ScanRequest) -> Result<ScanOutcome, TicketError> {
        let (code, payload) = match parse_input(&request.input) {
            Some(parsed) => parsed,
            None => return Ok(rejected(ScanRejection::bare(ReasonCode::InvalidFormat))),
        };

        let Some(mut ticket) = self.tickets.find_by_code(&code).await? else {
            debug!(ticket_code = %code, "Scanned ticket not found");
            return Ok(rejected(ScanRejection::bare(ReasonCode::TicketNotFound)));
        };

        if let Some(payload) = &payload {
            if !(payload.matches(&ticket) && self.guard.verify(payload)) {
                warn!(
                    target: "campus_tickets::security",
                    ticket_code = %code,
                    scanner = %request.scanner,
                    key_version = payload.v,
                    "QR payload failed integrity check"
                );
                return Ok(rejected(ScanRejection::bare(
                    ReasonCode::IntegrityCheckFailed,
                )));
            }
        }

        let event = match self.collaborators.event(ticket.event_id).await {
            Ok(event) => event,
            Err(TicketError::EventNotFound) => {
                return Ok(rejected(ScanRejection::bare(ReasonCode::EventNotFound)))
            }
            Err(e) => return Err(e),
        };
        if !event.scan_policy.permits_scanner(request.scanner) {
            info!(
                ticket_code = %code,
                event_id = %event.id,
                scanner = %request.scanner,
                "Scanner not on the event allow-list"
            );
            return Ok(rejected(ScanRejection::bare(
                ReasonCode::ScannerNotAuthorized,
            )));
        }
        let holder = self.collaborators.user(ticket.user_id).await?;
        let now = self.clock.now();

        for _ in 0..COMMIT_ATTEMPTS {
            let commit = match self.check(&ticket, &event, &request, now) {
                Ok(commit) => commit,
                Err(rejection) => {
                    if rejection.reason == ReasonCode::Expired
                        && ticket.status == TicketStatus::Active
                    {
                        self.expire(&ticket).await;
                    }
                    debug!(
                        ticket_code = %code,
                        reason = rejection.reason.as_str(),
                        "Scan rejected"
                    );
                    return Ok(rejected(rejection));
                }
            };

            match self.tickets.record_scan(&code, ticket.status, &commit).await? {
                Some(updated) => {
                    let first_admission = ticket.status == TicketStatus::Active;
                    return Ok(self
                        .admitted(updated, first_admission, holder, &event, commit)
                        .await);
                }
                None => {
                    debug!(ticket_code = %code, "Lost scan race, re-reading ticket");
                    ticket = match self.tickets.find_by_code(&code).await? {
                        Some(current) => current,
                        None => {
                            return Ok(rejected(ScanRejection::bare(ReasonCode::TicketNotFound)))
                        }
                    };
                }
            }
        }

        error!(ticket_code = %code, "Ticket status kept changing during scan");
        Err(TicketError::DependencyUnavailable("ticket store".to_string()))
    }

    /// Time window, status, geofence and reuse checks against one read of the ticket.
    fn check(
        &self,
        ticket: &Ticket,
        event: &EventInfo,
        request: &ScanRequest,
        now: DateTime<Utc>,
    ) -> Result<ScanCommit, ScanRejection> {
        if now < ticket.valid_from {
            return Err(ScanRejection::about(ReasonCode::TooEarly, ticket));
        }
        if now >= ticket.valid_until {
            return Err(ScanRejection::about(ReasonCode::Expired, ticket));
        }
        if !ticket.status.is_live() {
            return Err(ScanRejection::about(ReasonCode::TicketInactive, ticket));
        }

        let policy = &event.scan_policy;
        if policy.require_location {
            match &request.location {
                None => return Err(ScanRejection::about(ReasonCode::LocationMissing, ticket)),
                Some(point) if !point.is_valid() => {
                    return Err(ScanRejection::about(ReasonCode::LocationInvalid, ticket))
                }
                Some(point) => {
                    if let Some(fence) = &event.geofence {
                        if !fence.contains(point) {
                            return Err(ScanRejection::about(ReasonCode::LocationInvalid, ticket));
                        }
                    }
                }
            }
        }

        if ticket.status == TicketStatus::Used && !policy.allow_multiple_scans {
            return Err(ScanRejection::already_used(ticket));
        }

        let new_status = match (ticket.status, request.scan_type) {
            (TicketStatus::Active, _) | (TicketStatus::Used, ScanType::Entry) => {
                Some(TicketStatus::Used)
            }
            _ => None,
        };
        Ok(ScanCommit {
            new_status,
            event: ScanEvent {
                sequence: 0,
                scan_type: request.scan_type,
                scanned_at: now,
                scanned_by: request.scanner,
                location: request.location.clone(),
                device_info: request.device_info.clone(),
            },
            history_limit: self.settings.scan_history_limit,
        })
    }

    async fn admitted(
        &self,
        ticket: Ticket,
        first_admission: bool,
        holder: Option<UserSummary>,
        event: &EventInfo,
        commit: ScanCommit,
    ) -> ScanOutcome {
        let attendance = if first_admission {
            self.attendance.increment(event.id, 1).await
        } else {
            self.attendance.snapshot(event.id).await
        };
        let attendance = match attendance {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(
                    event_id = %event.id,
                    ticket_code = %ticket.ticket_code,
                    error = %e,
                    "Attendance update failed after committed scan"
                );
                None
            }
        };

        let mut scan = commit.event;
        scan.sequence = ticket.validation_count;
        info!(
            ticket_code = %ticket.ticket_code,
            event_id = %event.id,
            scanner = %scan.scanned_by,
            scan_type = scan.scan_type.as_str(),
            validation_count = ticket.validation_count,
            "Ticket scanned"
        );

        ScanOutcome::Admitted(Box::new(ScanReceipt {
            ticket: TicketSummary::from(&ticket),
            user: holder,
            event: EventSummary::from(event),
            scan,
            attendance,
        }))
    }

    async fn expire(&self, ticket: &Ticket) {
        let change = StatusChange {
            status: TicketStatus::Expired,
            cancellation: None,
        };
        match self
            .tickets
            .update_status(&ticket.ticket_code, TicketStatus::Active, &change)
            .await
        {
            Ok(Some(_)) => debug!(ticket_code = %ticket.ticket_code, "Ticket expired"),
            Ok(None) => {}
            Err(e) => warn!(
                ticket_code = %ticket.ticket_code,
                error = %e,
                "Failed to mark ticket expired"
            ),
        }
    }
}

fn rejected(rejection: ScanRejection) -> ScanOutcome {
    ScanOutcome::Rejected(rejection)
}

fn parse_input(input: &ScanInput) -> Option<(TicketCode, Option<QrPayload>)> {
    match input {
        ScanInput::Payload(raw) => {
            let payload = QrPayload::parse(raw).ok()?;
            Some((payload.code.clone(), Some(payload)))
        }
        ScanInput::Code(raw) => TicketCode::parse(raw.trim()).ok().map(|code| (code, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::models::{Geofence, ScanPolicy};
    use crate::tickets::fixture::{north_of, Fixture};

    #[tokio::test]
    async fn test_window_boundaries() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        fx.clock.set(ticket.valid_from - Duration::seconds(1));
        let outcome = fx.scan(&ticket).await;
        assert_eq!(outcome.reason(), ReasonCode::TooEarly);

        fx.clock.set(ticket.valid_until);
        let outcome = fx.scan(&ticket).await;
        assert_eq!(outcome.reason(), ReasonCode::Expired);

        let other_user = fx.register(&event);
        let other = fx.issue(&event, other_user).await;
        fx.clock.set(other.valid_until - Duration::seconds(1));
        assert!(fx.scan(&other).await.is_admitted());
    }

    #[tokio::test]
    async fn test_expired_scan_marks_ticket_expired() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        fx.clock.set(ticket.valid_until + Duration::minutes(1));
        assert_eq!(fx.scan(&ticket).await.reason(), ReasonCode::Expired);
        let stored = fx.stored(&ticket).await;
        assert_eq!(stored.status, TicketStatus::Expired);
    }

    #[tokio::test]
    async fn test_second_scan_reports_first_scan() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        assert!(fx.scan(&ticket).await.is_admitted());
        let ScanOutcome::Rejected(rejection) = fx.scan(&ticket).await else {
            panic!("second scan admitted");
        };
        assert_eq!(rejection.reason, ReasonCode::AlreadyUsed);
        assert_eq!(rejection.used_by, Some(fx.scanner));
        assert!(rejection.used_at.is_some());

        let snapshot = fx.attendance.snapshot(event.id).await.unwrap();
        assert_eq!(snapshot.actual_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_scans_admit_exactly_once() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let engine = fx.validation.clone();
            let request = fx.scan_request(&ticket);
            handles.push(tokio::spawn(async move { engine.validate(request).await }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ScanOutcome::Admitted(_) => admitted += 1,
                ScanOutcome::Rejected(r) => assert_eq!(r.reason, ReasonCode::AlreadyUsed),
            }
        }
        assert_eq!(admitted, 1);

        let snapshot = fx.attendance.snapshot(event.id).await.unwrap();
        assert_eq!(snapshot.actual_count, 1);
        assert_eq!(fx.stored(&ticket).await.validation_count, 1);
    }

    #[tokio::test]
    async fn test_multi_scan_events_count_every_validation_but_admit_once() {
        let fx = Fixture::new();
        let event = fx.event_with(|e| e.scan_policy.allow_multiple_scans = true);
        let user = fx.register(&event);
        let ticket = fx.issue(&event, user).await;

        for scan_type in [ScanType::Entry, ScanType::Checkpoint, ScanType::Exit, ScanType::Entry] {
            let mut request = fx.scan_request(&ticket);
            request.scan_type = scan_type;
            assert!(fx.validation.validate(request).await.unwrap().is_admitted());
        }

        let stored = fx.stored(&ticket).await;
        assert_eq!(stored.status, TicketStatus::Used);
        assert_eq!(stored.validation_count, 4);
        let sequences: Vec<u32> = stored.scan_history.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let snapshot = fx.attendance.snapshot(event.id).await.unwrap();
        assert_eq!(snapshot.actual_count, 1);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_integrity() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;
        let (_, other_user) = fx.registered_pair_for(&event);
        let other = fx.issue(&event, other_user).await;

        let original = QrPayload::parse(&ticket.qr_payload).unwrap();

        let mut swapped_user = original.clone();
        swapped_user.user = other_user;
        let mut swapped_code = original.clone();
        swapped_code.code = other.ticket_code.clone();
        let mut swapped_event = original;
        swapped_event.event = fx.event().id;

        for forged in [swapped_user, swapped_code, swapped_event] {
            let mut request = fx.scan_request(&ticket);
            request.input = ScanInput::Payload(forged.encode());
            let outcome = fx.validation.validate(request).await.unwrap();
            assert_eq!(outcome.reason(), ReasonCode::IntegrityCheckFailed);
        }
        assert_eq!(fx.stored(&ticket).await.status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_inputs() {
        let fx = Fixture::new();
        let mut request = fx.scan_request_for(ScanInput::Payload("{not json".to_string()));
        assert_eq!(
            fx.validation.validate(request.clone()).await.unwrap().reason(),
            ReasonCode::InvalidFormat
        );

        request.input = ScanInput::Code("CP-loyw3v28-0A1B2C3D".to_string());
        assert_eq!(
            fx.validation.validate(request).await.unwrap().reason(),
            ReasonCode::TicketNotFound
        );
    }

    #[tokio::test]
    async fn test_scanner_allow_list() {
        let fx = Fixture::new();
        let event = fx.event_with(|e| e.scan_policy.allowed_scanners = Some(vec![UserId::new()]));
        let user = fx.register(&event);
        let ticket = fx.issue(&event, user).await;

        assert_eq!(
            fx.scan(&ticket).await.reason(),
            ReasonCode::ScannerNotAuthorized
        );
    }

    #[tokio::test]
    async fn test_geofence_checks() {
        let fx = Fixture::new();
        let venue = GeoPoint::new(12.9716, 77.5946);
        let fence = Geofence {
            center: venue.clone(),
            radius_meters: 100.0,
        };
        let event = fx.event_with(|e| {
            e.geofence = Some(fence.clone());
            e.scan_policy = ScanPolicy {
                require_location: true,
                ..e.scan_policy.clone()
            };
        });

        let at_venue = fx.issue(&event, fx.register(&event)).await;
        let mut request = fx.scan_request(&at_venue);
        request.location = Some(venue.clone());
        assert!(fx.validation.validate(request).await.unwrap().is_admitted());

        let outside = fx.issue(&event, fx.register(&event)).await;
        let mut request = fx.scan_request(&outside);
        request.location = Some(north_of(&venue, 101.0));
        assert_eq!(
            fx.validation.validate(request).await.unwrap().reason(),
            ReasonCode::LocationInvalid
        );

        let missing = fx.issue(&event, fx.register(&event)).await;
        assert_eq!(fx.scan(&missing).await.reason(), ReasonCode::LocationMissing);
    }

    #[tokio::test]
    async fn test_typed_code_skips_stamp_but_runs_checks() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        let request = fx.scan_request_for(ScanInput::detect(ticket.ticket_code.to_string()));
        assert!(matches!(request.input, ScanInput::Code(_)));
        assert!(fx.validation.validate(request).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_user_directory_outage_leaves_ticket_untouched() {
        let fx = Fixture::new();
        let (event, user) = fx.registered_pair();
        let ticket = fx.issue(&event, user).await;

        fx.users.set_available(false);
        let err = fx
            .validation
            .validate(fx.scan_request(&ticket))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let stored = fx.stored(&ticket).await;
        assert_eq!(stored.status, TicketStatus::Active);
        assert_eq!(stored.validation_count, 0);
    }
}
