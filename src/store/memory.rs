//! In-process stores backed by `DashMap`.
//!
//! Each ticket lives in its own map entry, so a scan only locks the shard holding that ticket.
//! Lock order is always `live` before `tickets`; no method holds a `tickets` guard while
//! touching `live`.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::{
    AttendanceStore, EventDirectory, InsertOutcome, Page, Paged, RegistrationLedger, StoreError,
    TicketFilter, TicketStore, UserDirectory,
};
use crate::models::{
    AttendanceSnapshot, EventId, EventInfo, ScanCommit, StatusChange, StatusCounts, Ticket,
    TicketCode, TicketStatus, UserId, UserSummary,
};

#[derive(Default)]
pub struct MemoryTicketStore {
    tickets: DashMap<TicketCode, Ticket>,
    live: DashMap<(EventId, UserId), TicketCode>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    fn collect(&self, keep: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        self.tickets
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn release_slot(&self, ticket: &Ticket) {
        self.live.remove_if(&(ticket.event_id, ticket.user_id), |_, code| {
            *code == ticket.ticket_code
        });
    }
}

fn paginate(mut items: Vec<Ticket>, page: Page) -> Paged<Ticket> {
    let total = items.len() as u64;
    let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
    let items = if offset >= items.len() {
        Vec::new()
    } else {
        items
            .drain(offset..)
            .take(page.limit as usize)
            .collect()
    };
    Paged {
        items,
        total,
        page: page.page,
        limit: page.limit,
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn insert(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError> {
        match self.live.entry((ticket.event_id, ticket.user_id)) {
            Entry::Occupied(mut slot) => {
                let existing = self
                    .tickets
                    .get(slot.get())
                    .filter(|t| t.status.is_live())
                    .map(|t| t.clone());
                if let Some(existing) = existing {
                    return Ok(InsertOutcome::Existing(existing));
                }
                // Stale slot left by a cancellation that has not released it yet.
                match self.tickets.entry(ticket.ticket_code.clone()) {
                    Entry::Occupied(_) => Ok(InsertOutcome::CodeCollision),
                    Entry::Vacant(vacant) => {
                        slot.insert(ticket.ticket_code.clone());
                        vacant.insert(ticket.clone());
                        Ok(InsertOutcome::Created(ticket))
                    }
                }
            }
            Entry::Vacant(slot) => match self.tickets.entry(ticket.ticket_code.clone()) {
                Entry::Occupied(_) => Ok(InsertOutcome::CodeCollision),
                Entry::Vacant(vacant) => {
                    slot.insert(ticket.ticket_code.clone());
                    vacant.insert(ticket.clone());
                    Ok(InsertOutcome::Created(ticket))
                }
            },
        }
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets.get(code).map(|t| t.clone()))
    }

    async fn find_live(&self, event: EventId, user: UserId) -> Result<Option<Ticket>, StoreError> {
        let Some(code) = self.live.get(&(event, user)).map(|c| c.clone()) else {
            return Ok(None);
        };
        Ok(self
            .tickets
            .get(&code)
            .filter(|t| t.status.is_live())
            .map(|t| t.clone()))
    }

    async fn record_scan(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        commit: &ScanCommit,
    ) -> Result<Option<Ticket>, StoreError> {
        let Some(mut ticket) = self.tickets.get_mut(code) else {
            return Ok(None);
        };
        if ticket.status != expected {
            return Ok(None);
        }
        debug_assert!(commit
            .new_status
            .map_or(true, |next| expected.can_transition_to(next)));
        ticket.apply_scan(commit);
        Ok(Some(ticket.clone()))
    }

    async fn update_status(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        change: &StatusChange,
    ) -> Result<Option<Ticket>, StoreError> {
        let updated = {
            let Some(mut ticket) = self.tickets.get_mut(code) else {
                return Ok(None);
            };
            if ticket.status != expected {
                return Ok(None);
            }
            debug_assert!(expected.can_transition_to(change.status));
            ticket.status = change.status;
            if change.cancellation.is_some() {
                ticket.cancellation = change.cancellation.clone();
            }
            ticket.clone()
        };

        if !updated.status.is_live() {
            self.release_slot(&updated);
        }
        Ok(Some(updated))
    }

    async fn replace_payload(
        &self,
        code: &TicketCode,
        expected: TicketStatus,
        payload: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        let Some(mut ticket) = self.tickets.get_mut(code) else {
            return Ok(None);
        };
        if ticket.status != expected {
            return Ok(None);
        }
        ticket.qr_payload = payload.to_string();
        Ok(Some(ticket.clone()))
    }

    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError> {
        let mut items = self.collect(|t| t.user_id == user && filter.matches(t));
        items.sort_by_key(|t| Reverse(t.issued_at));
        Ok(paginate(items, page))
    }

    async fn list_for_event(
        &self,
        event: EventId,
        filter: &TicketFilter,
        page: Page,
    ) -> Result<Paged<Ticket>, StoreError> {
        let mut items = self.collect(|t| t.event_id == event && filter.matches(t));
        items.sort_by_key(|t| (Reverse(t.scanned_at), Reverse(t.issued_at)));
        Ok(paginate(items, page))
    }

    async fn status_counts(&self, event: EventId) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for entry in self.tickets.iter().filter(|e| e.event_id == event) {
            match entry.status {
                TicketStatus::Active => counts.active += 1,
                TicketStatus::Used => counts.used += 1,
                TicketStatus::Expired => counts.expired += 1,
                TicketStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn recent_scans(&self, event: EventId, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let mut items = self.collect(|t| t.event_id == event && t.last_validated.is_some());
        items.sort_by_key(|t| Reverse(t.last_validated));
        items.truncate(limit);
        Ok(items)
    }
}

#[derive(Default)]
struct Counters {
    expected: AtomicI64,
    actual: AtomicI64,
    last_updated_ms: AtomicI64,
}

impl Counters {
    fn add(counter: &AtomicI64, delta: i64) {
        if delta >= 0 {
            counter.fetch_add(delta, Ordering::AcqRel);
        } else {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + delta).max(0))
            });
        }
    }

    fn touch(&self, at: DateTime<Utc>) {
        self.last_updated_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
    }

    fn snapshot(&self, event: EventId) -> AttendanceSnapshot {
        let ms = self.last_updated_ms.load(Ordering::Acquire);
        let last_updated = (ms > 0)
            .then(|| Utc.timestamp_millis_opt(ms).single())
            .flatten();
        AttendanceSnapshot::new(
            event,
            self.expected.load(Ordering::Acquire).max(0) as u64,
            self.actual.load(Ordering::Acquire).max(0) as u64,
            last_updated,
        )
    }
}

#[derive(Default)]
pub struct MemoryAttendanceStore {
    counters: DashMap<EventId, Arc<Counters>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, event: EventId) -> Arc<Counters> {
        self.counters.entry(event).or_default().clone()
    }
}

#[async_trait]
impl AttendanceStore for MemoryAttendanceStore {
    async fn adjust_expected(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError> {
        let counters = self.counters(event);
        Counters::add(&counters.expected, delta);
        counters.touch(at);
        Ok(counters.snapshot(event))
    }

    async fn increment_actual(
        &self,
        event: EventId,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<AttendanceSnapshot, StoreError> {
        let counters = self.counters(event);
        Counters::add(&counters.actual, delta);
        counters.touch(at);
        Ok(counters.snapshot(event))
    }

    async fn snapshot(&self, event: EventId) -> Result<AttendanceSnapshot, StoreError> {
        Ok(self
            .counters
            .get(&event)
            .map(|c| c.snapshot(event))
            .unwrap_or_else(|| AttendanceSnapshot::empty(event)))
    }
}

/// Switch shared by the in-memory collaborators to simulate an outage.
#[derive(Debug)]
struct Availability(AtomicBool);

impl Default for Availability {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl Availability {
    fn check(&self, name: &str) -> Result<(), StoreError> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(name.to_string()))
        }
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }
}

#[derive(Default)]
pub struct MemoryEventDirectory {
    events: DashMap<EventId, EventInfo>,
    availability: Availability,
}

impl MemoryEventDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: EventInfo) {
        self.events.insert(event.id, event);
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }
}

#[async_trait]
impl EventDirectory for MemoryEventDirectory {
    async fn event(&self, id: EventId) -> Result<Option<EventInfo>, StoreError> {
        self.availability.check("event directory")?;
        Ok(self.events.get(&id).map(|e| e.clone()))
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<UserId, UserSummary>,
    availability: Availability,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserSummary) {
        self.users.insert(user.id, user);
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError> {
        self.availability.check("user directory")?;
        Ok(self.users.get(&id).map(|u| u.clone()))
    }
}

#[derive(Default)]
pub struct MemoryRegistrationLedger {
    registrations: DashSet<(EventId, UserId)>,
    availability: Availability,
}

impl MemoryRegistrationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: EventId, user: UserId) {
        self.registrations.insert((event, user));
    }

    pub fn unregister(&self, event: EventId, user: UserId) {
        self.registrations.remove(&(event, user));
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }
}

#[async_trait]
impl RegistrationLedger for MemoryRegistrationLedger {
    async fn is_registered(&self, event: EventId, user: UserId) -> Result<bool, StoreError> {
        self.availability.check("registration ledger")?;
        Ok(self.registrations.contains(&(event, user)))
    }
}
