use std::sync::Arc;

use crate::store::{AttendanceStore, EventDirectory, RegistrationLedger, TicketStore, UserDirectory};
use crate::tickets::{
    AttendanceAggregator, BulkCoordinator, CodeGenerator, Collaborators, IntegrityGuard,
    IssuanceService, TicketLifecycle, TicketReports, TicketSettings, ValidationEngine,
};
use crate::utils::clock::Clock;

/// Storage and collaborator backends the services are built on.
#[derive(Clone)]
pub struct Backends {
    pub tickets: Arc<dyn TicketStore>,
    pub attendance: Arc<dyn AttendanceStore>,
    pub events: Arc<dyn EventDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub registrations: Arc<dyn RegistrationLedger>,
}

impl Backends {
    /// All five concerns served by one backend, e.g. the Postgres store.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: TicketStore
            + AttendanceStore
            + EventDirectory
            + UserDirectory
            + RegistrationLedger
            + 'static,
    {
        Self {
            tickets: backend.clone(),
            attendance: backend.clone(),
            events: backend.clone(),
            users: backend.clone(),
            registrations: backend,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub issuance: IssuanceService,
    pub validation: ValidationEngine,
    pub lifecycle: TicketLifecycle,
    pub reports: TicketReports,
    pub bulk: BulkCoordinator,
    pub collaborators: Collaborators,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        backends: Backends,
        guard: Arc<IntegrityGuard>,
        codes: Arc<dyn CodeGenerator>,
        clock: Arc<dyn Clock>,
        settings: TicketSettings,
    ) -> Self {
        let collaborators = Collaborators::new(
            backends.events,
            backends.users,
            backends.registrations,
            settings.collaborator_timeout,
        );
        let attendance = AttendanceAggregator::new(backends.attendance, clock.clone());

        let issuance = IssuanceService::new(
            backends.tickets.clone(),
            collaborators.clone(),
            guard.clone(),
            codes,
            attendance.clone(),
            clock.clone(),
            settings.clone(),
        );
        let validation = ValidationEngine::new(
            backends.tickets.clone(),
            collaborators.clone(),
            guard.clone(),
            attendance.clone(),
            clock.clone(),
            settings.clone(),
        );
        let lifecycle = TicketLifecycle::new(
            backends.tickets.clone(),
            guard,
            attendance.clone(),
            clock.clone(),
        );
        let reports = TicketReports::new(backends.tickets, attendance);
        let bulk = BulkCoordinator::new(issuance.clone(), validation.clone(), settings);

        Self {
            issuance,
            validation,
            lifecycle,
            reports,
            bulk,
            collaborators,
            clock,
        }
    }
}
