use std::sync::Arc;

use tracing::debug;

use crate::models::{AttendanceSnapshot, EventId};
use crate::store::AttendanceStore;
use crate::tickets::error::TicketError;
use crate::utils::clock::Clock;

/// Maintains per-event expected/actual attendance on top of an atomic counter store.
#[derive(Clone)]
pub struct AttendanceAggregator {
    store: Arc<dyn AttendanceStore>,
    clock: Arc<dyn Clock>,
}

impl AttendanceAggregator {
    pub fn new(store: Arc<dyn AttendanceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records `delta` admissions.
    pub async fn increment(
        &self,
        event: EventId,
        delta: i64,
    ) -> Result<AttendanceSnapshot, TicketError> {
        let snapshot = self
            .store
            .increment_actual(event, delta, self.clock.now())
            .await?;
        debug!(
            event_id = %event,
            actual = snapshot.actual_count,
            expected = snapshot.expected_count,
            "Attendance updated"
        );
        Ok(snapshot)
    }

    /// A ticket was issued (`+1`) or cancelled (`-1`).
    pub async fn adjust_expected(
        &self,
        event: EventId,
        delta: i64,
    ) -> Result<AttendanceSnapshot, TicketError> {
        Ok(self
            .store
            .adjust_expected(event, delta, self.clock.now())
            .await?)
    }

    pub async fn snapshot(&self, event: EventId) -> Result<AttendanceSnapshot, TicketError> {
        Ok(self.store.snapshot(event).await?)
    }
}
