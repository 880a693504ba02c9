//! Verification Service
//!
//! Rate-limited HTTP service that creates payment-style transactions and
//! verifies them with biometric evidence before approval.
//!
//! ## Architecture
//!
//! Inbound requests pass the request gate (principal resolution + six-counter
//! rate limiting), then reach the verification orchestrator: a time-bounded
//! state machine over `Pending -> Approved | Rejected | Expired` backed by a
//! version-checked transaction store and external face/voice scoring
//! services. Every gated request is recorded for usage accounting after the
//! response is sent.
//!
//! ## Endpoints
//!
//! - `POST /transactions` - Create a pending transaction
//! - `GET /transactions/{id}` - Status read with lazy expiry
//! - `POST /transactions/{id}/verify/face` - Face evidence upload
//! - `POST /transactions/{id}/verify/voice` - Voice evidence + expected text
//! - `GET /health` - Health check (ungated)

pub mod config;
pub mod gate;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod storage;
pub mod usage;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use rate_limiter::RateLimiter;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use gate::{ClientConfig, ClientRegistry};
pub use orchestrator::{VerificationOrchestrator, VerificationPolicy};
pub use usage::UsageRecorder;

/// Application state shared across handlers and the gate
pub struct AppState {
    pub orchestrator: VerificationOrchestrator,
    pub limiter: RateLimiter,
    pub clients: ClientRegistry,
    pub usage: UsageRecorder,
}

impl AppState {
    pub fn new(
        orchestrator: VerificationOrchestrator,
        limiter: RateLimiter,
        clients: ClientRegistry,
        usage: UsageRecorder,
    ) -> Self {
        Self {
            orchestrator,
            limiter,
            clients,
            usage,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let gated = Router::new()
        .route("/transactions", post(handlers::create_transaction_handler))
        .route("/transactions/{id}", get(handlers::get_transaction_handler))
        .route(
            "/transactions/{id}/verify/face",
            post(handlers::verify_face_handler),
        )
        .route(
            "/transactions/{id}/verify/voice",
            post(handlers::verify_voice_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            gate::request_gate,
        ));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .merge(gated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
