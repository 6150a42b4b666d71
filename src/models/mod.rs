pub mod attendance;
pub mod event;
pub mod ids;
pub mod ticket;
pub mod user;

pub use attendance::{AttendanceSnapshot, StatusCounts};
pub use event::{EventInfo, EventSummary, Geofence, ScanPolicy};
pub use ids::{EventId, TicketCode, UserId};
pub use ticket::{
    Cancellation, GeoPoint, IssueContext, ScanCommit, ScanEvent, ScanHistory, ScanType,
    SealedMetadata, StatusChange, Ticket, TicketStatus, TicketSummary, TicketType,
};
pub use user::{Role, UserSummary};
