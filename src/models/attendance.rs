use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ids::EventId;

/// Point-in-time view of an event's attendance counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSnapshot {
    pub event_id: EventId,
    pub expected_count: u64,
    pub actual_count: u64,
    /// `actual / expected`, 0 when nothing is expected.
    pub attendance_rate: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AttendanceSnapshot {
    pub fn new(
        event_id: EventId,
        expected_count: u64,
        actual_count: u64,
        last_updated: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            event_id,
            expected_count,
            actual_count,
            attendance_rate: attendance_rate(expected_count, actual_count),
            last_updated,
        }
    }

    pub fn empty(event_id: EventId) -> Self {
        Self::new(event_id, 0, 0, None)
    }
}

pub fn attendance_rate(expected: u64, actual: u64) -> f64 {
    if expected == 0 {
        0.0
    } else {
        actual as f64 / expected as f64
    }
}

/// Ticket counts per status for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub active: u64,
    pub used: u64,
    pub expired: u64,
    pub cancelled: u64,
}
