//! Ticket issuance and scan-time validation.
//!
//! Services here only talk to storage through the traits in [`crate::store`], and to the
//! event, user and registration collaborators through [`Collaborators`], which bounds every
//! call with a timeout so a partitioned dependency fails fast with a retryable error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::models::{EventId, EventInfo, UserId, UserSummary};
use crate::store::{EventDirectory, RegistrationLedger, StoreError, UserDirectory};

pub mod attendance;
pub mod bulk;
pub mod code;
pub mod error;
pub mod geo;
pub mod integrity;
pub mod issuance;
pub mod lifecycle;
pub mod qr;
pub mod reason;
pub mod reports;
pub mod validation;

#[cfg(test)]
pub(crate) mod fixture;

pub use attendance::AttendanceAggregator;
pub use bulk::{BulkCoordinator, BulkIssue, BulkItemIssue, BulkReport, BulkSummary, BulkValidate};
pub use code::{CodeGenerator, RandomCodeGenerator};
pub use error::TicketError;
pub use integrity::{CryptoError, IntegrityGuard, KeyRing, QrPayload};
pub use issuance::{IssuanceService, IssueRequest, Issued};
pub use lifecycle::TicketLifecycle;
pub use reason::ReasonCode;
pub use reports::{AttendanceDashboard, EventScans, RecentScan, TicketReports};
pub use validation::{
    ScanInput, ScanOutcome, ScanReceipt, ScanRejection, ScanRequest, ValidationEngine,
};

/// Tunables shared by the ticket services.
#[derive(Debug, Clone)]
pub struct TicketSettings {
    pub code_max_attempts: u32,
    pub scan_history_limit: usize,
    pub bulk_max_items: usize,
    pub bulk_concurrency: usize,
    pub collaborator_timeout: Duration,
}

impl Default for TicketSettings {
    fn default() -> Self {
        Self {
            code_max_attempts: 5,
            scan_history_limit: 20,
            bulk_max_items: 100,
            bulk_concurrency: 8,
            collaborator_timeout: Duration::from_millis(2000),
        }
    }
}

/// The external systems the ticket core consumes.
#[derive(Clone)]
pub struct Collaborators {
    events: Arc<dyn EventDirectory>,
    users: Arc<dyn UserDirectory>,
    registrations: Arc<dyn RegistrationLedger>,
    timeout: Duration,
}

impl Collaborators {
    pub fn new(
        events: Arc<dyn EventDirectory>,
        users: Arc<dyn UserDirectory>,
        registrations: Arc<dyn RegistrationLedger>,
        timeout: Duration,
    ) -> Self {
        Self {
            events,
            users,
            registrations,
            timeout,
        }
    }

    pub async fn event(&self, id: EventId) -> Result<EventInfo, TicketError> {
        self.bounded("event directory", self.events.event(id))
            .await?
            .ok_or(TicketError::EventNotFound)
    }

    pub async fn user(&self, id: UserId) -> Result<Option<UserSummary>, TicketError> {
        self.bounded("user directory", self.users.user(id)).await
    }

    pub async fn is_registered(&self, event: EventId, user: UserId) -> Result<bool, TicketError> {
        self.bounded(
            "registration ledger",
            self.registrations.is_registered(event, user),
        )
        .await
    }

    async fn bounded<T>(
        &self,
        name: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, TicketError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| {
                error!(collaborator = name, error = %e, "Collaborator call failed");
                match e {
                    StoreError::Corrupt(_) => TicketError::Storage(e),
                    _ => TicketError::DependencyUnavailable(name.to_string()),
                }
            }),
            Err(_) => {
                error!(
                    collaborator = name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Collaborator call timed out"
                );
                Err(TicketError::DependencyUnavailable(name.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::store::{MemoryEventDirectory, MemoryRegistrationLedger, MemoryUserDirectory};

    struct StalledDirectory;

    #[async_trait]
    impl EventDirectory for StalledDirectory {
        async fn event(&self, _id: EventId) -> Result<Option<EventInfo>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_collaborator_times_out_as_retryable() {
        let collaborators = Collaborators::new(
            Arc::new(StalledDirectory),
            Arc::new(MemoryUserDirectory::new()),
            Arc::new(MemoryRegistrationLedger::new()),
            Duration::from_millis(50),
        );

        let err = collaborators.event(EventId::new()).await.unwrap_err();
        assert!(matches!(err, TicketError::DependencyUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_found() {
        let collaborators = Collaborators::new(
            Arc::new(MemoryEventDirectory::new()),
            Arc::new(MemoryUserDirectory::new()),
            Arc::new(MemoryRegistrationLedger::new()),
            Duration::from_millis(50),
        );
        assert!(matches!(
            collaborators.event(EventId::new()).await,
            Err(TicketError::EventNotFound)
        ));
    }
}
