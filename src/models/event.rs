use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ids::{EventId, UserId};
use crate::models::ticket::GeoPoint;

/// Circular area around the venue that scanner devices must be inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_meters: f64,
}

/// Per-event rules the validation engine enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPolicy {
    /// Minutes before the start at which tickets become scannable.
    pub scan_window_minutes: u32,
    /// Minutes after the start at which tickets stop being scannable.
    pub post_window_minutes: u32,
    pub allow_multiple_scans: bool,
    pub require_location: bool,
    /// `None` means any authenticated scanner may validate.
    pub allowed_scanners: Option<Vec<UserId>>,
}

impl ScanPolicy {
    pub fn with_windows(scan_window_minutes: u32, post_window_minutes: u32) -> Self {
        Self {
            scan_window_minutes,
            post_window_minutes,
            allow_multiple_scans: false,
            require_location: false,
            allowed_scanners: None,
        }
    }

    pub fn permits_scanner(&self, scanner: UserId) -> bool {
        match &self.allowed_scanners {
            Some(allowed) => allowed.contains(&scanner),
            None => true,
        }
    }
}

/// Event as seen by the ticketing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    pub id: EventId,
    pub organizer_id: UserId,
    pub title: String,
    pub venue: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub geofence: Option<Geofence>,
    pub scan_policy: ScanPolicy,
}

impl EventInfo {
    pub fn is_organized_by(&self, user: UserId) -> bool {
        self.organizer_id == user
    }
}

/// Identity fields echoed back to scanner operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: EventId,
    pub title: String,
    pub venue: String,
    pub start_time: DateTime<Utc>,
}

impl From<&EventInfo> for EventSummary {
    fn from(event: &EventInfo) -> Self {
        Self {
            id: event.id,
            title: event.title.clone(),
            venue: event.venue.clone(),
            start_time: event.start_time,
        }
    }
}
