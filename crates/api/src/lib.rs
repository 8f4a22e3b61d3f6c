//! HTTP surface for the treasury backend.
//!
//! Endpoints:
//! - `POST /payjoin`: BIP78 receiver negotiation
//! - `POST /signing-requests/:id/signatures`: co-signer submission
//! - `GET /signing-requests`: read-only listing with filters
//! - `GET /health`
//!
//! CORS middleware for cross-origin requests, request logging with tracing,
//! JSON error bodies throughout (BIP78 wire format on the payjoin route).

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Create and configure the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    // Allow all origins; the payjoin endpoint is meant to be reachable by
    // arbitrary sender wallets.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/payjoin", post(routes::payjoin::propose))
        .route(
            "/signing-requests/:id/signatures",
            post(routes::signing::submit_signature),
        )
        .route(
            "/signing-requests",
            get(routes::signing::list_signing_requests),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start the API server on the specified address
pub async fn start_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_router(state);

    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
