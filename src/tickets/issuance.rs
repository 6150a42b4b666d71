use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::models::ticket::ScanHistory;
use crate::models::{
    EventId, EventInfo, IssueContext, SealedMetadata, Ticket, TicketStatus, TicketType, UserId,
};
use crate::store::{InsertOutcome, TicketStore};
use crate::tickets::attendance::AttendanceAggregator;
use crate::tickets::code::CodeGenerator;
use crate::tickets::error::TicketError;
use crate::tickets::integrity::{IntegrityGuard, TicketMetadata};
use crate::tickets::{Collaborators, TicketSettings};
use crate::utils::clock::Clock;

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub event_id: EventId,
    pub user_id: UserId,
    pub ticket_type: TicketType,
    pub seat_number: Option<String>,
    pub special_access: Vec<String>,
    pub context: IssueContext,
}

impl IssueRequest {
    pub fn new(event_id: EventId, user_id: UserId) -> Self {
        Self {
            event_id,
            user_id,
            ticket_type: TicketType::default(),
            seat_number: None,
            special_access: Vec::new(),
            context: IssueContext::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Issued {
    pub ticket: Ticket,
    /// `false` when an existing live ticket was returned instead.
    pub created: bool,
}

/// Scan window of a ticket for `event`, derived from its start and scan policy.
pub fn validity_window(event: &EventInfo) -> Result<(DateTime<Utc>, DateTime<Utc>), TicketError> {
    let policy = &event.scan_policy;
    let valid_from = event.start_time - Duration::minutes(i64::from(policy.scan_window_minutes));
    let valid_until = event.start_time + Duration::minutes(i64::from(policy.post_window_minutes));
    if valid_from >= valid_until {
        return Err(TicketError::InvalidValidityWindow);
    }
    Ok((valid_from, valid_until))
}

/// Creates tickets for confirmed registrations. Issuing is idempotent per (event, user).
#[derive(Clone)]
pub struct IssuanceService {
    tickets: Arc<dyn TicketStore>,
    collaborators: Collaborators,
    guard: Arc<IntegrityGuard>,
    codes: Arc<dyn CodeGenerator>,
    attendance: AttendanceAggregator,
    clock: Arc<dyn Clock>,
    settings: TicketSettings,
}

impl IssuanceService {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        collaborators: Collaborators,
        guard: Arc<IntegrityGuard>,
        codes: Arc<dyn CodeGenerator>,
        attendance: AttendanceAggregator,
        clock: Arc<dyn Clock>,
        settings: TicketSettings,
    ) -> Self {
        Self {
            tickets,
            collaborators,
            guard,
            codes,
            attendance,
            clock,
            settings,
        }
    }

    pub async fn issue(&self, request: IssueRequest) -> Result<Issued, TicketError> {
        let event = self.collaborators.event(request.event_id).await?;
        if !self
            .collaborators
            .is_registered(request.event_id, request.user_id)
            .await?
        {
            return Err(TicketError::UserNotRegistered);
        }

        if let Some(existing) = self
            .tickets
            .find_live(request.event_id, request.user_id)
            .await?
        {
            return Ok(Issued {
                ticket: existing,
                created: false,
            });
        }

        let window = validity_window(&event)?;
        let attempts = self.settings.code_max_attempts.max(1);
        for attempt in 1..=attempts {
            let ticket = self.mint(&request, window)?;
            let code = ticket.ticket_code.clone();

            match self.tickets.insert(ticket).await? {
                InsertOutcome::Created(ticket) => {
                    if let Err(e) = self.attendance.adjust_expected(ticket.event_id, 1).await {
                        error!(
                            event_id = %ticket.event_id,
                            ticket_code = %ticket.ticket_code,
                            error = %e,
                            "Failed to bump expected attendance"
                        );
                    }
                    info!(
                        ticket_code = %ticket.ticket_code,
                        event_id = %ticket.event_id,
                        user_id = %ticket.user_id,
                        "Ticket issued"
                    );
                    return Ok(Issued {
                        ticket,
                        created: true,
                    });
                }
                InsertOutcome::Existing(ticket) => {
                    return Ok(Issued {
                        ticket,
                        created: false,
                    });
                }
                InsertOutcome::CodeCollision => {
                    warn!(ticket_code = %code, attempt, "Ticket code collision, minting another");
                }
            }
        }

        Err(TicketError::CodeGenerationExhausted { attempts })
    }

    fn mint(
        &self,
        request: &IssueRequest,
        (valid_from, valid_until): (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Ticket, TicketError> {
        let now = self.clock.now();
        let code = self.codes.generate(now);
        let payload = self
            .guard
            .issue_payload(&code, request.event_id, request.user_id, now);

        let mut ticket = Ticket {
            ticket_code: code,
            event_id: request.event_id,
            user_id: request.user_id,
            qr_payload: payload.encode(),
            metadata: SealedMetadata {
                cipher_text: String::new(),
                salt: String::new(),
            },
            status: TicketStatus::Active,
            valid_from,
            valid_until,
            issued_at: now,
            scanned_at: None,
            scanned_by: None,
            scan_location: None,
            last_validated: None,
            validation_count: 0,
            scan_history: ScanHistory::default(),
            ticket_type: request.ticket_type,
            seat_number: request.seat_number.clone(),
            special_access: request.special_access.clone(),
            issue_context: request.context.clone(),
            cancellation: None,
        };
        ticket.metadata = self.guard.encrypt(&TicketMetadata::from(&ticket))?;
        Ok(ticket)
    }
}
