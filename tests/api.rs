use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use campus_tickets::models::{EventId, EventInfo, Role, ScanPolicy, UserId, UserSummary};
use campus_tickets::routes::create_routes;
use campus_tickets::state::{AppState, Backends};
use campus_tickets::store::{
    MemoryAttendanceStore, MemoryEventDirectory, MemoryRegistrationLedger, MemoryTicketStore,
    MemoryUserDirectory,
};
use campus_tickets::tickets::{IntegrityGuard, KeyRing, RandomCodeGenerator, TicketSettings};
use campus_tickets::utils::clock::ManualClock;

fn event_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 9, 2, 9, 0, 0).unwrap()
}

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
    events: Arc<MemoryEventDirectory>,
    users: Arc<MemoryUserDirectory>,
    registrations: Arc<MemoryRegistrationLedger>,
    organizer: UserId,
}

impl TestApp {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(event_start() - Duration::minutes(5)));
        let events = Arc::new(MemoryEventDirectory::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let registrations = Arc::new(MemoryRegistrationLedger::new());

        let keys = KeyRing::new(1, vec![9u8; 32], vec![4u8; 32]).unwrap();
        let state = AppState::new(
            Backends {
                tickets: Arc::new(MemoryTicketStore::new()),
                attendance: Arc::new(MemoryAttendanceStore::new()),
                events: events.clone(),
                users: users.clone(),
                registrations: registrations.clone(),
            },
            Arc::new(IntegrityGuard::new(keys)),
            Arc::new(RandomCodeGenerator::default()),
            clock.clone(),
            TicketSettings::default(),
        );

        let organizer = UserId::new();
        users.insert(user(organizer, Role::Organizer));

        Self {
            router: create_routes(state, &[], false),
            clock,
            events,
            users,
            registrations,
            organizer,
        }
    }

    fn event(&self) -> EventId {
        let id = EventId::new();
        self.events.insert(EventInfo {
            id,
            organizer_id: self.organizer,
            title: "Orientation Day".to_string(),
            venue: "Great Hall".to_string(),
            start_time: event_start(),
            end_time: Some(event_start() + Duration::hours(2)),
            geofence: None,
            scan_policy: ScanPolicy::with_windows(30, 120),
        });
        id
    }

    fn student(&self, event: EventId) -> UserId {
        let id = UserId::new();
        self.users.insert(user(id, Role::Student));
        self.registrations.register(event, id);
        id
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        caller: Option<UserId>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            builder = builder.header("x-user-id", caller.to_string());
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn issue(&self, event: EventId, holder: UserId) -> Value {
        let (status, body) = self
            .send(Method::POST, &format!("/tickets/{event}"), Some(holder), None)
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["data"].clone()
    }

    async fn validate(&self, payload: &Value) -> (StatusCode, Value) {
        self.send(
            Method::POST,
            "/tickets/validate",
            Some(self.organizer),
            Some(json!({ "qrPayload": payload, "scanType": "entry" })),
        )
        .await
    }
}

fn user(id: UserId, role: Role) -> UserSummary {
    UserSummary {
        id,
        first_name: "Sam".to_string(),
        last_name: "Rivera".to_string(),
        email: format!("{id}@campus.test"),
        role,
    }
}

#[tokio::test]
async fn test_health_check_carries_security_headers() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.get("strict-transport-security").is_none());
}

#[tokio::test]
async fn test_requests_without_caller_are_unauthorized() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/tickets", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "AUTH_ERROR");

    let (status, _) = app
        .send(Method::GET, "/tickets", Some(UserId::new()), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_issue_is_created_once_then_returned() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);

    let first = app.issue(event, student).await;
    assert_eq!(first["status"], "active");
    assert!(first["qrCodeImage"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
    assert!(first.get("metadata").is_none());

    let (status, body) = app
        .send(Method::POST, &format!("/tickets/{event}"), Some(student), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ticketCode"], first["ticketCode"]);

    let (status, body) = app.send(Method::GET, "/tickets", Some(student), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pagination"]["total"], 1);
}

#[tokio::test]
async fn test_unregistered_user_cannot_get_a_ticket() {
    let app = TestApp::new();
    let event = app.event();
    let outsider = UserId::new();
    app.users.insert(user(outsider, Role::Student));

    let (status, body) = app
        .send(Method::POST, &format!("/tickets/{event}"), Some(outsider), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "USER_NOT_REGISTERED");
}

#[tokio::test]
async fn test_students_cannot_issue_for_others() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let classmate = app.student(event);

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/tickets/{event}"),
            Some(student),
            Some(json!({ "userId": classmate })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/tickets/{event}"),
            Some(app.organizer),
            Some(json!({ "userId": classmate, "ticketType": "vip" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["userId"], json!(classmate));
    assert_eq!(body["data"]["ticketType"], "vip");
}

#[tokio::test]
async fn test_second_scan_reports_first_admission() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let ticket = app.issue(event, student).await;

    let (status, body) = app.validate(&ticket["qrPayload"]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"], "success");
    assert_eq!(body["reasonCode"], "SCAN_SUCCESS");
    assert_eq!(body["ticket"]["status"], "used");
    assert_eq!(body["attendance"]["actualCount"], 1);
    assert_eq!(body["attendance"]["expectedCount"], 1);

    let (status, body) = app.validate(&ticket["qrPayload"]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["outcome"], "failure");
    assert_eq!(body["reasonCode"], "TICKET_ALREADY_USED");
    assert_eq!(body["usedBy"], json!(app.organizer));
    assert!(body["usedAt"].is_string());
}

#[tokio::test]
async fn test_validate_rejects_early_and_malformed_scans() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let ticket = app.issue(event, student).await;

    let (status, body) = app
        .send(
            Method::POST,
            "/tickets/validate",
            Some(app.organizer),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reasonCode"], "INVALID_FORMAT");

    app.clock.set(event_start() - Duration::hours(1));
    let (status, body) = app.validate(&ticket["qrPayload"]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reasonCode"], "TICKET_TOO_EARLY");
}

#[tokio::test]
async fn test_cancelled_ticket_is_inactive_at_the_door() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let ticket = app.issue(event, student).await;
    let code = ticket["ticketCode"].as_str().unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/tickets/{code}/cancel"),
            Some(student),
            Some(json!({ "reason": "Cannot attend" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(body["data"]["cancellation"]["reason"], "Cannot attend");

    let (status, body) = app.validate(&ticket["qrPayload"]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reasonCode"], "TICKET_INACTIVE");
}

#[tokio::test]
async fn test_ticket_detail_is_private_to_owner_and_organizer() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let stranger = app.student(event);
    let ticket = app.issue(event, student).await;
    let uri = format!("/tickets/{}", ticket["ticketCode"].as_str().unwrap());

    let (status, body) = app.send(Method::GET, &uri, Some(student), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["isCurrentlyValid"], true);
    assert!(body["data"]["scanHistory"].as_array().unwrap().is_empty());

    let (status, _) = app.send(Method::GET, &uri, Some(app.organizer), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send(Method::GET, &uri, Some(stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_regenerated_payload_admits_holder() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let ticket = app.issue(event, student).await;
    let code = ticket["ticketCode"].as_str().unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/tickets/{code}/regenerate"),
            Some(student),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let regenerated = body["data"]["qrPayload"].clone();
    assert_ne!(regenerated, ticket["qrPayload"]);
    assert!(body["data"]["regeneratedAt"].is_string());

    let (status, body) = app.validate(&regenerated).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_bulk_validate_sorts_items_into_buckets() {
    let app = TestApp::new();
    let event = app.event();
    let scanned = app.issue(event, app.student(event)).await;
    let fresh = app.issue(event, app.student(event)).await;
    let (status, _) = app.validate(&scanned["qrPayload"]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send(
            Method::POST,
            "/tickets/bulk-validate",
            Some(app.organizer),
            Some(json!({
                "ticketCodes": [scanned["ticketCode"], fresh["ticketCode"], "not-a-code"],
                "scanType": "entry"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let summary = &body["data"]["summary"];
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["success"], 1);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["failed"], 1);
    assert_eq!(body["data"]["skipped"][0]["reasonCode"], "TICKET_ALREADY_USED");
    assert_eq!(body["data"]["failed"][0]["reasonCode"], "INVALID_FORMAT");
}

#[tokio::test]
async fn test_bulk_issue_requires_organizer() {
    let app = TestApp::new();
    let event = app.event();
    let students: Vec<UserId> = (0..3).map(|_| app.student(event)).collect();
    let uri = format!("/tickets/bulk/{event}");

    let (status, _) = app
        .send(
            Method::POST,
            &uri,
            Some(students[0]),
            Some(json!({ "userIds": students })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(
            Method::POST,
            &uri,
            Some(app.organizer),
            Some(json!({ "userIds": students })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["summary"]["success"], 3);
    assert_eq!(body["data"]["succeeded"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_attendance_dashboard_and_scans() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    let ticket = app.issue(event, student).await;
    app.issue(event, app.student(event)).await;
    app.validate(&ticket["qrPayload"]).await;

    let (status, body) = app
        .send(
            Method::GET,
            &format!("/events/{event}/attendance"),
            Some(app.organizer),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let data = &body["data"];
    assert_eq!(data["event"]["title"], "Orientation Day");
    assert_eq!(data["attendance"]["expectedCount"], 2);
    assert_eq!(data["attendance"]["actualCount"], 1);
    assert_eq!(data["statuses"]["used"], 1);
    assert_eq!(data["recentScans"][0]["ticketCode"], ticket["ticketCode"]);

    let (status, _) = app
        .send(
            Method::GET,
            &format!("/events/{event}/attendance"),
            Some(student),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(
            Method::GET,
            &format!("/events/{event}/scans?status=used"),
            Some(app.organizer),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["pagination"]["total"], 1);
    assert_eq!(body["data"]["statuses"]["active"], 1);
}

#[tokio::test]
async fn test_registration_outage_is_retryable() {
    let app = TestApp::new();
    let event = app.event();
    let student = app.student(event);
    app.registrations.set_available(false);

    let (status, body) = app
        .send(Method::POST, &format!("/tickets/{event}"), Some(student), None)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "DEPENDENCY_UNAVAILABLE");
    assert_eq!(body["error"]["details"]["retryable"], true);
}
