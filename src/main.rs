use std::sync::Arc;

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use campus_tickets::config::Config;
use campus_tickets::routes::create_routes;
use campus_tickets::state::{AppState, Backends};
use campus_tickets::store::PostgresStore;
use campus_tickets::tickets::{IntegrityGuard, RandomCodeGenerator};
use campus_tickets::utils::clock::SystemClock;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campus_tickets=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().expect("Invalid configuration");
    tracing::info!(database = ?config.database, "Configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let store = Arc::new(PostgresStore::new(
        pool,
        config.default_scan_window_minutes,
        config.default_post_window_minutes,
    ));
    let codes = RandomCodeGenerator::new(&config.code_prefix).expect("Invalid ticket code prefix");
    let state = AppState::new(
        Backends::shared(store),
        Arc::new(IntegrityGuard::new(config.keys)),
        Arc::new(codes),
        Arc::new(SystemClock),
        config.tickets,
    );

    let app: Router = create_routes(state, &config.cors_allowed_origins, config.production);

    tracing::info!("Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}
