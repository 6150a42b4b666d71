use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ids::{EventId, TicketCode, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Used,
    Expired,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Active => "active",
            TicketStatus::Used => "used",
            TicketStatus::Expired => "expired",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// `active` and `used` tickets occupy the (event, user) slot.
    pub fn is_live(&self) -> bool {
        matches!(self, TicketStatus::Active | TicketStatus::Used)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `used -> used` is a re-admission and only reachable on events allowing multiple scans;
    /// that policy is enforced by the validation engine, not here.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Active, Used) | (Active, Expired) | (Active, Cancelled) | (Used, Used)
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ticket status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TicketStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TicketStatus::Active),
            "used" => Ok(TicketStatus::Used),
            "expired" => Ok(TicketStatus::Expired),
            "cancelled" => Ok(TicketStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketType {
    #[default]
    Regular,
    Vip,
    Student,
    Faculty,
    Guest,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketType::Regular => "regular",
            TicketType::Vip => "vip",
            TicketType::Student => "student",
            TicketType::Faculty => "faculty",
            TicketType::Guest => "guest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ticket type '{0}'")]
pub struct UnknownTicketType(pub String);

impl FromStr for TicketType {
    type Err = UnknownTicketType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(TicketType::Regular),
            "vip" => Ok(TicketType::Vip),
            "student" => Ok(TicketType::Student),
            "faculty" => Ok(TicketType::Faculty),
            "guest" => Ok(TicketType::Guest),
            other => Err(UnknownTicketType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Entry,
    Exit,
    Checkpoint,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Entry => "entry",
            ScanType::Exit => "exit",
            ScanType::Checkpoint => "checkpoint",
        }
    }
}

/// A WGS84 coordinate, optionally with the address the scanner app resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One successful validation of a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    /// Equals the ticket's `validation_count` right after this scan.
    pub sequence: u32,
    pub scan_type: ScanType,
    pub scanned_at: DateTime<Utc>,
    pub scanned_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
}

/// Most recent scans of a ticket, oldest first, capped at a fixed length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanHistory(VecDeque<ScanEvent>);

impl ScanHistory {
    pub fn push(&mut self, event: ScanEvent, limit: usize) {
        self.0.push_back(event);
        while self.0.len() > limit.max(1) {
            self.0.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ScanEvent> {
        self.0.back()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScanEvent> {
        self.0.iter()
    }
}

/// Encrypted secondary copy of the ticket identity. The salt is required to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMetadata {
    pub cipher_text: String,
    pub salt: String,
}

/// Where and how a ticket was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueContext {
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

/// An entry credential bound to one (event, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub ticket_code: TicketCode,
    pub event_id: EventId,
    pub user_id: UserId,
    pub qr_payload: String,
    pub metadata: SealedMetadata,
    pub status: TicketStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub scanned_by: Option<UserId>,
    pub scan_location: Option<GeoPoint>,
    pub last_validated: Option<DateTime<Utc>>,
    pub validation_count: u32,
    pub scan_history: ScanHistory,
    pub ticket_type: TicketType,
    pub seat_number: Option<String>,
    pub special_access: Vec<String>,
    pub issue_context: IssueContext,
    pub cancellation: Option<Cancellation>,
}

impl Ticket {
    pub fn is_currently_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Active && now >= self.valid_from && now < self.valid_until
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.valid_until - now).max(Duration::zero())
    }

    /// Applies a successful scan. Callers hold whatever lock makes this atomic.
    pub fn apply_scan(&mut self, commit: &ScanCommit) {
        if let Some(next) = commit.new_status {
            self.status = next;
            self.scanned_at = Some(commit.event.scanned_at);
            self.scanned_by = Some(commit.event.scanned_by);
            if commit.event.location.is_some() {
                self.scan_location = commit.event.location.clone();
            }
        }
        self.validation_count = self.validation_count.saturating_add(1);
        self.last_validated = Some(commit.event.scanned_at);

        let mut event = commit.event.clone();
        event.sequence = self.validation_count;
        self.scan_history.push(event, commit.history_limit);
    }
}

/// The parts of a ticket shown to scanner operators and holders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketSummary {
    pub ticket_code: TicketCode,
    pub event_id: EventId,
    pub user_id: UserId,
    pub status: TicketStatus,
    pub ticket_type: TicketType,
    pub seat_number: Option<String>,
    pub special_access: Vec<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub validation_count: u32,
}

impl From<&Ticket> for TicketSummary {
    fn from(ticket: &Ticket) -> Self {
        Self {
            ticket_code: ticket.ticket_code.clone(),
            event_id: ticket.event_id,
            user_id: ticket.user_id,
            status: ticket.status,
            ticket_type: ticket.ticket_type,
            seat_number: ticket.seat_number.clone(),
            special_access: ticket.special_access.clone(),
            valid_from: ticket.valid_from,
            valid_until: ticket.valid_until,
            validation_count: ticket.validation_count,
        }
    }
}

/// A status-conditional scan write, handed to the store as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCommit {
    /// `Some` when the scan moves the ticket to a new status (admission).
    pub new_status: Option<TicketStatus>,
    pub event: ScanEvent,
    pub history_limit: usize,
}

/// A status-conditional lifecycle write (cancellation, lazy expiry).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: TicketStatus,
    pub cancellation: Option<Cancellation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(at: DateTime<Utc>, scan_type: ScanType) -> ScanEvent {
        ScanEvent {
            sequence: 0,
            scan_type,
            scanned_at: at,
            scanned_by: UserId::new(),
            location: None,
            device_info: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use TicketStatus::*;
        assert!(Active.can_transition_to(Used));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Used.can_transition_to(Used));
        assert!(!Used.can_transition_to(Active));
        assert!(!Used.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Used));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TicketStatus::Active,
            TicketStatus::Used,
            TicketStatus::Expired,
            TicketStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_unknown_ticket_type_names_the_type() {
        assert_eq!("vip".parse::<TicketType>().unwrap(), TicketType::Vip);

        let err = "platinum".parse::<TicketType>().unwrap_err();
        assert_eq!(err, UnknownTicketType("platinum".to_string()));
        assert_eq!(err.to_string(), "unknown ticket type 'platinum'");
    }

    #[test]
    fn test_scan_history_is_capped() {
        let mut history = ScanHistory::default();
        let now = Utc::now();
        for i in 0..5 {
            let mut event = scan(now, ScanType::Checkpoint);
            event.sequence = i;
            history.push(event, 3);
        }
        assert_eq!(history.len(), 3);
        let sequences: Vec<u32> = history.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(40.0, -73.9).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_scan_type_defaults_to_entry() {
        assert_eq!(ScanType::default(), ScanType::Entry);
        let parsed: ScanType = serde_json::from_str("\"checkpoint\"").unwrap();
        assert_eq!(parsed, ScanType::Checkpoint);
    }
}
