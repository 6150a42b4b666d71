use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, SecurityHeaders};
use crate::handlers::{events, health_check, tickets, validation};
use crate::state::AppState;

/// `/tickets/:id` is an event id on POST (issue) and a ticket code on GET (detail). Static
/// segments such as `validate` and `bulk` take priority over the parameter.
pub fn create_routes(state: AppState, cors_origins: &[String], production: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/tickets", get(tickets::list_my_tickets))
        .route("/tickets/validate", post(validation::validate_ticket))
        .route("/tickets/bulk-validate", post(validation::bulk_validate))
        .route("/tickets/bulk/:event_id", post(tickets::bulk_issue))
        .route(
            "/tickets/:id",
            get(tickets::get_ticket).post(tickets::issue_ticket),
        )
        .route("/tickets/:id/cancel", post(tickets::cancel_ticket))
        .route("/tickets/:id/regenerate", post(tickets::regenerate_ticket))
        .route(
            "/events/:event_id/attendance",
            get(events::attendance_dashboard),
        )
        .route("/events/:event_id/scans", get(events::event_scans));

    SecurityHeaders::new(production)
        .apply(router)
        .layer(create_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
