//! In-memory wiring of the ticket services for unit tests.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::models::{
    EventId, EventInfo, GeoPoint, Role, ScanPolicy, ScanType, Ticket, UserId, UserSummary,
};
use crate::state::{AppState, Backends};
use crate::store::{
    MemoryAttendanceStore, MemoryEventDirectory, MemoryRegistrationLedger, MemoryTicketStore,
    MemoryUserDirectory, TicketStore,
};
use crate::tickets::geo::EARTH_RADIUS_METERS;
use crate::tickets::issuance::IssueRequest;
use crate::tickets::reports::TicketReports;
use crate::tickets::{
    AttendanceAggregator, BulkCoordinator, CodeGenerator, Collaborators, IntegrityGuard,
    IssuanceService, KeyRing, RandomCodeGenerator, ScanInput, ScanOutcome, ScanRequest,
    TicketLifecycle, TicketSettings, ValidationEngine,
};
use crate::utils::clock::{Clock, ManualClock};

pub fn event_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 3, 14, 18, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Point `meters` due north of `origin`.
pub fn north_of(origin: &GeoPoint, meters: f64) -> GeoPoint {
    let d_lat = (meters / EARTH_RADIUS_METERS).to_degrees();
    GeoPoint::new(origin.latitude + d_lat, origin.longitude)
}

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub tickets: Arc<MemoryTicketStore>,
    pub events: Arc<MemoryEventDirectory>,
    pub users: Arc<MemoryUserDirectory>,
    pub registrations: Arc<MemoryRegistrationLedger>,
    pub guard: Arc<IntegrityGuard>,
    pub attendance: AttendanceAggregator,
    pub issuance: IssuanceService,
    pub validation: ValidationEngine,
    pub lifecycle: TicketLifecycle,
    pub reports: TicketReports,
    pub bulk: BulkCoordinator,
    pub scanner: UserId,
    collaborators: Collaborators,
    settings: TicketSettings,
}

impl Fixture {
    /// The clock starts ten minutes before [`event_start`], inside the default scan window.
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(event_start() - Duration::minutes(10)));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let tickets = Arc::new(MemoryTicketStore::new());
        let attendance_store = Arc::new(MemoryAttendanceStore::new());
        let events = Arc::new(MemoryEventDirectory::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let registrations = Arc::new(MemoryRegistrationLedger::new());
        let settings = TicketSettings {
            collaborator_timeout: StdDuration::from_millis(500),
            ..TicketSettings::default()
        };

        let keys = KeyRing::new(1, vec![3u8; 32], vec![5u8; 32]).unwrap();
        let guard = Arc::new(IntegrityGuard::new(keys));
        let state = AppState::new(
            Backends {
                tickets: tickets.clone(),
                attendance: attendance_store.clone(),
                events: events.clone(),
                users: users.clone(),
                registrations: registrations.clone(),
            },
            guard.clone(),
            Arc::new(RandomCodeGenerator::default()),
            dyn_clock.clone(),
            settings.clone(),
        );

        let scanner = UserId::new();
        users.insert(user(scanner, Role::Organizer));

        Self {
            clock,
            tickets,
            events,
            users,
            registrations,
            guard,
            attendance: AttendanceAggregator::new(attendance_store, dyn_clock),
            issuance: state.issuance,
            validation: state.validation,
            lifecycle: state.lifecycle,
            reports: state.reports,
            bulk: state.bulk,
            scanner,
            collaborators: state.collaborators,
            settings,
        }
    }

    pub fn issuance_with_codes(&self, codes: Arc<dyn CodeGenerator>) -> IssuanceService {
        IssuanceService::new(
            self.tickets.clone(),
            self.collaborators.clone(),
            self.guard.clone(),
            codes,
            self.attendance.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
    }

    pub fn event(&self) -> EventInfo {
        self.event_with(|_| {})
    }

    pub fn event_with(&self, customize: impl FnOnce(&mut EventInfo)) -> EventInfo {
        let mut event = EventInfo {
            id: EventId::new(),
            organizer_id: self.scanner,
            title: "Spring Hackathon".to_string(),
            venue: "Main Auditorium".to_string(),
            start_time: event_start(),
            end_time: Some(event_start() + Duration::hours(3)),
            geofence: None,
            scan_policy: ScanPolicy::with_windows(30, 120),
        };
        customize(&mut event);
        self.events.insert(event.clone());
        event
    }

    /// A new registered user of `event`.
    pub fn register(&self, event: &EventInfo) -> UserId {
        let id = UserId::new();
        self.users.insert(user(id, Role::Student));
        self.registrations.register(event.id, id);
        id
    }

    pub fn registered_pair(&self) -> (EventInfo, UserId) {
        let event = self.event();
        let user = self.register(&event);
        (event, user)
    }

    pub fn registered_pair_for(&self, event: &EventInfo) -> (EventInfo, UserId) {
        (event.clone(), self.register(event))
    }

    pub async fn issue(&self, event: &EventInfo, user: UserId) -> Ticket {
        self.issuance
            .issue(IssueRequest::new(event.id, user))
            .await
            .unwrap()
            .ticket
    }

    pub async fn stored(&self, ticket: &Ticket) -> Ticket {
        self.tickets
            .find_by_code(&ticket.ticket_code)
            .await
            .unwrap()
            .unwrap()
    }

    pub fn scan_request_for(&self, input: ScanInput) -> ScanRequest {
        ScanRequest {
            input,
            scanner: self.scanner,
            scan_type: ScanType::Entry,
            location: None,
            device_info: None,
        }
    }

    pub fn scan_request(&self, ticket: &Ticket) -> ScanRequest {
        self.scan_request_for(ScanInput::Payload(ticket.qr_payload.clone()))
    }

    pub async fn scan(&self, ticket: &Ticket) -> ScanOutcome {
        self.validation
            .validate(self.scan_request(ticket))
            .await
            .unwrap()
    }
}

fn user(id: UserId, role: Role) -> UserSummary {
    UserSummary {
        id,
        first_name: "Test".to_string(),
        last_name: "User".to_string(),
        email: format!("{id}@campus.test"),
        role,
    }
}
