//! PostgreSQL implementation of every store trait.
//!
//! The one-live-ticket-per-pair rule is a partial unique index, so `insert` never needs a lock:
//! `ON CONFLICT DO NOTHING` either creates the row or tells us something was in the way.
//! Status writes are `UPDATE ... WHERE status = $expected RETURNING *`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{
    AttendanceStore, EventDirectory, InsertOutcome, Page, Paged, RegistrationLedger, StoreError,
    TicketFilter, TicketStore, UserDirectory,
};
use crate::models::{
    AttendanceSnapshot, Cancellation, EventId, EventInfo, GeoPoint, Geofence, IssueContext, Role,
    ScanCommit, ScanHistory, ScanPolicy, SealedMetadata, StatusChange, StatusCounts, Ticket,
    TicketCode, TicketStatus, UserId, UserSummary,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    default_scan_window_minutes: u32,
    default_post_window_minutes: u32,
}

impl PostgresStore {
    /// The window defaults apply to events whose own columns are null.
    pub fn new(
        pool: PgPool,
        default_scan_window_minutes: u32,
        default_post_window_minutes: u32,
    ) -> Self {
        Self {
            pool,
            default_scan_window_minutes,
            default_post_window_minutes,
        }
    }
}

#[derive(Debug, FromRow)]
struct TicketRow {
    ticket_code: String,
    event_id: Uuid,
    user_id: Uuid,
    qr_payload: String,
    metadata_cipher: String,
    metadata_salt: String,
    status: String,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    scanned_at: Option<DateTime<Utc>>,
    scanned_by: Option<Uuid>,
    scan_location: Option<Json<GeoPoint>>,
    last_validated: Option<DateTime<Utc>>,
    validation_count: i32,
    scan_history: Json<ScanHistory>,
    ticket_type: String,
    seat_number: Option<String>,
    special_access: Vec<String>,
    device_fingerprint: Option<String>,
    ip_address: Option<String>,
    cancellation_reason: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, StoreError> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("{what} of {}", row.ticket_code));
        let ticket_code = TicketCode::parse(&row.ticket_code).map_err(|_| corrupt("code"))?;
        let status = row.status.parse().map_err(|_| corrupt("status"))?;
        let ticket_type = row.ticket_type.parse().map_err(|_| corrupt("ticket type"))?;
        let validation_count =
            u32::try_from(row.validation_count).map_err(|_| corrupt("validation count"))?;

        Ok(Ticket {
            ticket_code,
            event_id: EventId::from_uuid(row.event_id),
            user_id: UserId::from_uuid(row.user_id),
            qr_payload: row.qr_payload,
            metadata: SealedMetadata {
                cipher_text: row.metadata_cipher,
                salt: row.metadata_salt,
            },
            status,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            issued_at: row.issued_at,
            scanned_at: row.scanned_at,
            scanned_by: row.scanned_by.map(UserId::from_uuid),
            scan_location: row.scan_location.map(|Json(p)| p),
            last_validated: row.last_validated,
            validation_count,
            scan_history: row.scan_history.0,
            ticket_type,
            seat_number: row.seat_number,
            special_access: row.special_access,
            issue_context: IssueContext {
                device_fingerprint: row.device_fingerprint,
                ip_address: row.ip_address,
            },
            cancellation: row.cancelled_at.map(|cancelled_at| Cancellation {
                reason: row.cancellation_reason,
                cancelled_at,
            }),
        })
    }
}

fn into_ticket(row: Option<TicketRow>) -> Result<Option<Ticket>, StoreError> {
    row.map(Ticket::try_from).transpose()
}

fn into_tickets(rows: Vec<TicketRow>) -> Result<Vec<Ticket>, StoreError> {
    rows.into_iter().map(Ticket::try_from).collect()
}

fn paged(items: Vec<Ticket>, total: i64, page: Page) -> Paged<Ticket> {
    Paged {
        items,
        total: u64::try_from(total).unwrap_or(0),
        page: page.page,
        limit: page.limit,
    }
}

fn offset(page: Page) -> i64 {
    i64::try_from(page.offset()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TicketStore for PostgresStore {
    async fn insert(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            INSERT INTO tickets (
                ticket_code, event_id, user_id, qr_payload, metadata_cipher, metadata_salt,
                status, valid_from, valid_until, issued_at, validation_count, scan_history,
                ticket_type, seat_number, special_access, device_fingerprint, ip_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(ticket.ticket_code.as_str())
        .bind(ticket.event_id.as_uuid())
        .bind(ticket.user_id.as_uuid())
        .bind(&ticket.qr_payload)
        .bind(&ticket.metadata.cipher_text)
        .bind(&ticket.metadata.salt)
        .bind(ticket.status.as_str())
        .bind(ticket.valid_from)
        .bind(ticket.valid_until)
        .bind(ticket.issued_at)
        .bind(Json(&ticket.scan_history))
        .bind(ticket.ticket_type.as_str())
        .bind(&ticket.seat_number)
        .bind(&ticket.special_access)
        .bind(&ticket.issue_context.device_fingerprint)
        .bind(&ticket.issue_context.ip_address)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Created(Ticket::try_from(row)?));
        }

        // Either the code or the pair's live slot was taken.
        match self.find_live(ticket.event_id, ticket.user_id).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => {
                debug!(code = %ticket.ticket_code, "Ticket code already taken");
                Ok(InsertOutcome::CodeCollision)
            }
        }
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>("SELECT * FROM tickets WHERE ticket_code = $1")
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await?;
        into_ticket(row)
    }

    async fn find_live(&self, event: EventId, user: UserId) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT * FROM tickets
            WHERE event_id = $1 AND user_id = $2 AND status IN ('active', 'used')
            "#,
        )
        .bind(event.as_uuid())
        .bind(user.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        into_ticket(row)
    }

    async fn record_scan(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        commit: &ScanCommit,
    ) -> Result<Option<Ticket>, StoreError> {
        // The history cap needs the current history, so the row is locked while it is rebuilt.
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, TicketRow>(
            "SELECT * FROM tickets WHERE ticket_code = $1 AND status = $2 FOR UPDATE",
        )
        .bind(code.as_str())
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut ticket) = into_ticket(current)? else {
            return Ok(None);
        };

        ticket.apply_scan(commit);
        let validation_count = i32::try_from(ticket.validation_count).unwrap_or(i32::MAX);
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            UPDATE tickets
            SET status = $3,
                scanned_at = $4,
                scanned_by = $5,
                scan_location = $6,
                last_validated = $7,
                validation_count = $8,
                scan_history = $9
            WHERE ticket_code = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(code.as_str())
        .bind(expected.as_str())
        .bind(ticket.status.as_str())
        .bind(ticket.scanned_at)
        .bind(ticket.scanned_by.map(|u| *u.as_uuid()))
        .bind(ticket.scan_location.as_ref().map(Json))
        .bind(ticket.last_validated)
        .bind(validation_count)
        .bind(Json(&ticket.scan_history))
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        into_ticket(row)
    }

    async fn update_status(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        change: &StatusChange,
    ) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            UPDATE tickets
            SET status = $3,
                cancellation_reason = CASE WHEN $4 THEN $5 ELSE cancellation_reason END,
                cancelled_at = CASE WHEN $4 THEN $6 ELSE cancelled_at END
            WHERE ticket_code = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(code.as_str())
        .bind(expected.as_str())
        .bind(change.status.as_str())
        .bind(change.cancellation.is_some())
        .bind(change.cancellation.as_ref().and_then(|c| c.reason.clone()))
        .bind(change.cancellation.as_ref().map(|c| c.cancelled_at))
        .fetch_optional(&self.pool)
        .await?;
        into_ticket(row)
    }

    async fn replace_payload(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        payload: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            UPDATE tickets SET qr_payload = $3
            WHERE ticket_code = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(code.as_str())
        .bind(expected.as_str())
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;
        into_ticket(row)
    }

    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let event = filter.event_id.map(|e| *e.as_uuid());

        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT * FROM tickets
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR event_id = $3)
            ORDER BY issued_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user.as_uuid())
        .bind(status)
        .bind(event)
        .bind(i64::from(page.limit))
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tickets
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR event_id = $3)
            "#,
        )
        .bind(user.as_uuid())
        .bind(status)
        .bind(event)
        .fetch_one(&self.pool)
        .await?;

        Ok(paged(into_tickets(rows)?, total, page))
    }

    async fn list_for_event(
        &self,
        event: EventId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError> {
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT * FROM tickets
            WHERE event_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY scanned_at DESC NULLS LAST, issued_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(event.as_uuid())
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tickets WHERE event_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(event.as_uuid())
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(paged(into_tickets(rows)?, total, page))
    }

    async fn status_counts(&self, event: EventId) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tickets WHERE event_id = $1 GROUP BY status",
        )
        .bind(event.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<TicketStatus>() {
                Ok(TicketStatus::Active) => counts.active = count,
                Ok(TicketStatus::Used) => counts.used = count,
                Ok(TicketStatus::Expired) => counts.expired = count,
                Ok(TicketStatus::Cancelled) => counts.cancelled = count,
                Err(e) => return Err(StoreError::Corrupt(e.to_string())),
            }
        }
        Ok(counts)
    }

    async fn recent_scans(&self, event: EventId, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT * FROM tickets
            WHERE event_id = $1 AND last_validated IS NOT NULL
            ORDER BY last_validated DESC
            LIMIT $2
            "#,
        )
        .bind(event.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        into_tickets(rows)
    }
}

#[derive(Debug, FromRow)]
struct AttendanceRow {
    event_id: Uuid,
    expected_count: i64,
    actual_count: i64,
    last_updated: Option<DateTime<Utc>>,
}

impl From<AttendanceRow> for AttendanceSnapshot {
    fn from(row: AttendanceRow) -> Self {
        AttendanceSnapshot::new(
            EventId::from_uuid(row.event_id),
            u64::try_from(row.expected_count).unwrap_or(0),
            u64::try_from(row.actual_count).unwrap_or(0),
            row.last_updated,
        )
    }
}

#[async_trait]
impl AttendanceStore for PostgresStore {
    async fn adjust_expected(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError> {
        let row = sqlx::query_as::<_, AttendanceRow>(
            r#"
            INSERT INTO event_attendance (event_id, expected_count, actual_count, last_updated)
            VALUES ($1, GREATEST($2, 0), 0, $3)
            ON CONFLICT (event_id) DO UPDATE
            SET expected_count = GREATEST(event_attendance.expected_count + $2, 0),
                last_updated = GREATEST(event_attendance.last_updated, $3)
            RETURNING event_id, expected_count, actual_count, last_updated
            "#,
        )
        .bind(event.as_uuid())
        .bind(delta)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn increment_actual(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError> {
        let row = sqlx::query_as::<_, AttendanceRow>(
            r#"
            INSERT INTO event_attendance (event_id, expected_count, actual_count, last_updated)
            VALUES ($1, 0, GREATEST($2, 0), $3)
            ON CONFLICT (event_id) DO UPDATE
            SET actual_count = GREATEST(event_attendance.actual_count + $2, 0),
                last_updated = GREATEST(event_attendance.last_updated, $3)
            RETURNING event_id, expected_count, actual_count, last_updated
            "#,
        )
        .bind(event.as_uuid())
        .bind(delta)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn snapshot(&self, event: EventId) -> Result<AttendanceSnapshot, StoreError> {
        let row = sqlx::query_as::<_, AttendanceRow>(
            r#"
            SELECT event_id, expected_count, actual_count, last_updated
            FROM event_attendance WHERE event_id = $1
            "#,
        )
        .bind(event.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(AttendanceSnapshot::from)
            .unwrap_or_else(|| AttendanceSnapshot::empty(event)))
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    organizer_id: Uuid,
    title: String,
    venue: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    geofence_radius_meters: Option<f64>,
    scan_window_minutes: Option<i32>,
    post_window_minutes: Option<i32>,
    allow_multiple_scans: bool,
    require_location: bool,
    allowed_scanners: Option<Vec<Uuid>>,
}

impl PostgresStore {
    fn event_info(&self, row: EventRow) -> EventInfo {
        let minutes = |value: Option<i32>, default: u32| {
            value
                .and_then(|m| u32::try_from(m).ok())
                .unwrap_or(default)
        };
        let geofence = match (row.latitude, row.longitude, row.geofence_radius_meters) {
            (Some(latitude), Some(longitude), Some(radius_meters)) => Some(Geofence {
                center: GeoPoint::new(latitude, longitude),
                radius_meters,
            }),
            _ => None,
        };

        EventInfo {
            id: EventId::from_uuid(row.id),
            organizer_id: UserId::from_uuid(row.organizer_id),
            title: row.title,
            venue: row.venue,
            start_time: row.start_time,
            end_time: row.end_time,
            geofence,
            scan_policy: ScanPolicy {
                scan_window_minutes: minutes(
                    row.scan_window_minutes,
                    self.default_scan_window_minutes,
                ),
                post_window_minutes: minutes(
                    row.post_window_minutes,
                    self.default_post_window_minutes,
                ),
                allow_multiple_scans: row.allow_multiple_scans,
                require_location: row.require_location,
                allowed_scanners: row
                    .allowed_scanners
                    .map(|ids| ids.into_iter().map(UserId::from_uuid).collect()),
            },
        }
    }
}

#[async_trait]
impl EventDirectory for PostgresStore {
    async fn event(&self, id: EventId) -> Result<Option<EventInfo>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, organizer_id, title, venue, start_time, end_time, latitude, longitude,
                   geofence_radius_meters, scan_window_minutes, post_window_minutes,
                   allow_multiple_scans, require_location, allowed_scanners
            FROM events WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| self.event_info(row)))
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    email: String,
    role: String,
}

impl From<UserRow> for UserSummary {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId::from_uuid(row.id),
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            role: Role::parse(&row.role),
        }
    }
}

#[async_trait]
impl UserDirectory for PostgresStore {
    async fn user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, first_name, last_name, email, role FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserSummary::from))
    }
}

#[async_trait]
impl RegistrationLedger for PostgresStore {
    async fn is_registered(&self, event: EventId, user: UserId) -> Result<bool, StoreError> {
        let registered: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM event_registrations
                WHERE event_id = $1 AND user_id = $2 AND status = 'registered'
            )
            "#,
        )
        .bind(event.as_uuid())
        .bind(user.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(registered)
    }
}
