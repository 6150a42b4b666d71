//! Persistence for tickets and attendance, plus the adapters to the event, user and
//! registration collaborators.
//!
//! Every write that depends on a ticket's current status goes through a compare-and-swap
//! (`expected` status in, `None` out when the ticket moved on), so concurrent scanners can
//! never both win the same transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{
    AttendanceSnapshot, EventId, EventInfo, ScanCommit, StatusChange, StatusCounts, Ticket,
    TicketCode, TicketStatus, UserId, UserSummary,
};

pub mod memory;
pub mod postgres;

pub use memory::{
    MemoryAttendanceStore, MemoryEventDirectory, MemoryRegistrationLedger, MemoryTicketStore,
    MemoryUserDirectory,
};
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors a caller can reasonably retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            StoreError::Corrupt(_) => false,
        }
    }
}

/// Result of inserting a freshly minted ticket.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Ticket),
    /// A live ticket already holds the (event, user) slot.
    Existing(Ticket),
    /// The ticket code is taken; mint another one.
    CodeCollision,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub event_id: Option<EventId>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.status.map_or(true, |s| ticket.status == s)
            && self.event_id.map_or(true, |e| ticket.event_id == e)
    }
}

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Clamps to page >= 1 and 1 <= limit <= [`MAX_PAGE_SIZE`].
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Paged<T> {
    pub fn pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.limit.max(1)))
    }
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Inserts `ticket` unless its code is taken or the pair already holds a live ticket.
    async fn insert(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError>;

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>, StoreError>;

    /// The `active` or `used` ticket of a pair, if any.
    async fn find_live(&self, event: EventId, user: UserId) -> Result<Option<Ticket>, StoreError>;

    /// Applies `commit` iff the ticket's status is still `expected`.
    async fn record_scan(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        commit: &ScanCommit,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Moves the ticket to `change.status` iff its status is still `expected`.
    async fn update_status(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        change: &StatusChange,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Swaps the QR payload iff the ticket's status is still `expected`.
    async fn replace_payload(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        payload: &str,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError>;

    /// Most recently scanned first, then newest.
    async fn list_for_event(
        &self,
        event: EventId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError>;

    async fn status_counts(&self, event: EventId) -> Result<StatusCounts, StoreError>;

    /// Tickets of the event with at least one scan, latest scan first.
    async fn recent_scans(&self, event: EventId, limit: usize) -> Result<Vec<Ticket>, StoreError>;
}

/// Per-event attendance counters. Implementations must update them with atomic increments.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Adds `delta` (may be negative) to the expected count, clamped at zero.
    async fn adjust_expected(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError>;

    /// Adds `delta` to the actual count, clamped at zero.
    async fn increment_actual(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError>;

    async fn snapshot(&self, event: EventId) -> Result<AttendanceSnapshot, StoreError>;
}

#[async_trait]
pub trait EventDirectory: Send + Sync {
    async fn event(&self, id: EventId) -> Result<Option<EventInfo>, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError>;
}

#[async_trait]
pub trait RegistrationLedger: Send + Sync {
    /// Whether `user` holds an active registration for `event`.
    async fn is_registered(&self, event: EventId, user: UserId) -> Result<bool, StoreError>;
}
