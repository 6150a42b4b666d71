use std::sync::Arc;

use tracing::{error, info};

use crate::models::{Cancellation, StatusChange, Ticket, TicketCode, TicketStatus};
use crate::store::TicketStore;
use crate::tickets::attendance::AttendanceAggregator;
use crate::tickets::error::TicketError;
use crate::tickets::integrity::{IntegrityGuard, QrPayload};
use crate::tickets::reason::ReasonCode;
use crate::utils::clock::Clock;

/// Holder- and organizer-initiated changes to an issued ticket.
#[derive(Clone)]
pub struct TicketLifecycle {
    tickets: Arc<dyn TicketStore>,
    guard: Arc<IntegrityGuard>,
    attendance: AttendanceAggregator,
    clock: Arc<dyn Clock>,
}

impl TicketLifecycle {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        guard: Arc<IntegrityGuard>,
        attendance: AttendanceAggregator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tickets,
            guard,
            attendance,
            clock,
        }
    }

    pub async fn find(&self, code: &TicketCode) -> Result<Ticket, TicketError> {
        self.tickets
            .find_by_code(code)
            .await?
            .ok_or_else(|| TicketError::TicketNotFound(code.clone()))
    }

    /// Cancels an active ticket and frees its (event, user) slot. Irreversible.
    pub async fn cancel(
        &self,
        code: &TicketCode,
        reason: Option<String>,
    ) -> Result<Ticket, TicketError> {
        let change = StatusChange {
            status: TicketStatus::Cancelled,
            cancellation: Some(Cancellation {
                reason,
                cancelled_at: self.clock.now(),
            }),
        };

        // A lost swap means the status moved on; the re-read reports the terminal state.
        for _ in 0..2 {
            let ticket = self.find(code).await?;
            match ticket.status {
                TicketStatus::Active => {}
                TicketStatus::Used => return Err(TicketError::Rejected(ReasonCode::AlreadyUsed)),
                TicketStatus::Cancelled => {
                    return Err(TicketError::Rejected(ReasonCode::TicketAlreadyCancelled))
                }
                TicketStatus::Expired => return Err(TicketError::Rejected(ReasonCode::Expired)),
            }

            if let Some(cancelled) = self
                .tickets
                .update_status(code, TicketStatus::Active, &change)
                .await?
            {
                if let Err(e) = self.attendance.adjust_expected(cancelled.event_id, -1).await {
                    error!(
                        event_id = %cancelled.event_id,
                        ticket_code = %code,
                        error = %e,
                        "Failed to lower expected attendance"
                    );
                }
                info!(ticket_code = %code, event_id = %cancelled.event_id, "Ticket cancelled");
                return Ok(cancelled);
            }
        }

        Err(TicketError::DependencyUnavailable("ticket store".to_string()))
    }

    /// Re-signs the QR payload of an active ticket. Identity and validity window are kept,
    /// and the payload it replaces still verifies.
    pub async fn regenerate(&self, code: &TicketCode) -> Result<(Ticket, QrPayload), TicketError> {
        let ticket = self.find(code).await?;
        ensure_regenerable(ticket.status)?;

        let original = QrPayload::parse(&ticket.qr_payload).unwrap_or_else(|_| {
            self.guard.issue_payload(
                &ticket.ticket_code,
                ticket.event_id,
                ticket.user_id,
                ticket.issued_at,
            )
        });
        let payload = self.guard.regenerate_payload(&original, self.clock.now());

        match self
            .tickets
            .replace_payload(code, TicketStatus::Active, &payload.encode())
            .await?
        {
            Some(updated) => {
                info!(ticket_code = %code, "Ticket payload regenerated");
                Ok((updated, payload))
            }
            None => {
                let current = self.find(code).await?;
                ensure_regenerable(current.status)?;
                Err(TicketError::DependencyUnavailable("ticket store".to_string()))
            }
        }
    }
}

fn ensure_regenerable(status: TicketStatus) -> Result<(), TicketError> {
    match status {
        TicketStatus::Active => Ok(()),
        TicketStatus::Used => Err(TicketError::Rejected(ReasonCode::AlreadyUsed)),
        TicketStatus::Expired | TicketStatus::Cancelled => {
            Err(TicketError::Rejected(ReasonCode::TicketInactive))
        }
    }
}
