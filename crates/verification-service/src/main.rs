//! Verification Service
//!
//! HTTP service for biometric transaction verification, gated by a
//! multi-tier rate limiter.

use anyhow::{Context, Result};
use rate_limiter::{RateLimiter, RedisCounterStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use verification_service::config::Config;
use verification_service::providers::{HttpFaceMatcher, HttpReferenceVault, HttpSpeechTranscriber};
use verification_service::storage::RedisTransactionStore;
use verification_service::usage::RedisUsageSink;
use verification_service::{
    create_router, AppState, ClientRegistry, UsageRecorder, VerificationOrchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Verification Service...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Redis URL: {}", config.redis_url);
    info!("Face matcher: {}", config.face_matcher_url);
    info!("Speech API: {}", config.speech_api_url);

    // Storage
    let counter_store = RedisCounterStore::new(&config.redis_url)
        .await
        .context("Failed to connect counter store")?;
    let transaction_store = RedisTransactionStore::new(&config.redis_url)
        .await
        .context("Failed to connect transaction store")?;
    let usage_sink = RedisUsageSink::new(&config.redis_url)
        .await
        .context("Failed to connect usage sink")?;

    // Verification providers
    let timeout = config.provider_timeout();
    let face_matcher = HttpFaceMatcher::new(config.face_matcher_url.clone(), timeout)
        .context("Failed to build face matcher client")?;
    let transcriber = HttpSpeechTranscriber::new(config.speech_api_url.clone(), timeout)
        .context("Failed to build speech transcriber client")?;
    let vault = HttpReferenceVault::new(config.reference_vault_url.clone(), timeout)
        .context("Failed to build reference vault client")?;

    // Registered clients
    let clients = config.load_clients().context("Failed to load clients")?;
    info!("Loaded {} registered client(s)", clients.len());

    let orchestrator = VerificationOrchestrator::new(
        Arc::new(transaction_store),
        Arc::new(face_matcher),
        Arc::new(transcriber),
        Arc::new(vault),
        config.verification_policy(),
    );
    let limiter = RateLimiter::new(Arc::new(counter_store));
    let usage = UsageRecorder::new(Arc::new(usage_sink));

    let state = AppState::new(orchestrator, limiter, ClientRegistry::new(clients), usage);
    let app = create_router(state);

    // Start server
    let listener = TcpListener::bind(&config.api_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_address()))?;

    info!("Verification Service listening on {}", config.api_address());
    info!("Health check: http://{}/health", config.api_address());
    info!("API endpoints:");
    info!("  POST /transactions - Create transaction");
    info!("  GET /transactions/{{id}} - Transaction status");
    info!("  POST /transactions/{{id}}/verify/face - Face verification");
    info!("  POST /transactions/{{id}}/verify/voice - Voice verification");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
