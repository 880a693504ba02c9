//! Request gate: principal resolution, rate limiting, usage accounting
//!
//! Every gated request resolves its principal once, passes the six-counter
//! rate limit check, and is recorded for usage accounting after the response
//! is produced. The usage event is an explicit post-response hook, not an
//! interception of the response writer.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use rate_limiter::{Decision, RateLimitConfig, Window};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use veriflow_common::{Error, Principal};

use crate::handlers::ApiError;
use crate::usage::UsageRecord;
use crate::AppState;

/// A registered client organization
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    pub api_key: String,

    #[serde(default)]
    pub limits: RateLimitConfig,
}

/// Lookup of registered clients by API key
#[derive(Default)]
pub struct ClientRegistry {
    by_key: HashMap<String, ClientConfig>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<ClientConfig>) -> Self {
        Self {
            by_key: clients
                .into_iter()
                .map(|client| (client.api_key.clone(), client))
                .collect(),
        }
    }

    pub fn resolve(&self, api_key: &str) -> Option<&ClientConfig> {
        self.by_key.get(api_key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Gate middleware applied to every transaction route
pub async fn request_gate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();

    let api_key = header_str(req.headers(), "x-api-key");
    let client = match api_key.and_then(|key| state.clients.resolve(key)) {
        Some(client) => client.clone(),
        None => {
            warn!(
                "Rejected request to {} without a valid client key",
                req.uri().path()
            );
            return ApiError::from(Error::UnknownClient).into_response();
        }
    };

    let principal = match bearer_user(req.headers()) {
        Some(user_id) => Principal::User {
            user_id,
            client_id: client.client_id.clone(),
        },
        None => Principal::ApiClient {
            client_id: client.client_id.clone(),
        },
    };

    let source = source_address(&req);
    let endpoint = req.uri().path().to_string();
    let method = req.method().to_string();

    let decision = match state
        .limiter
        .check_and_consume(&client.client_id, &source, &client.limits)
        .await
    {
        Ok(decision) => decision,
        Err(Error::StorageUnavailable(e)) => {
            // Fail closed: an unreachable counter store denies traffic
            // instead of letting it through unmetered.
            error!("Counter store unavailable, failing closed: {}", e);
            let response = ApiError::from(Error::StorageUnavailable(e)).into_response();
            record_usage(&state, &client.client_id, &endpoint, &method, &response, started);
            return response;
        }
        Err(e) => {
            error!("Rate limit check failed: {}", e);
            let response = ApiError::from(e).into_response();
            record_usage(&state, &client.client_id, &endpoint, &method, &response, started);
            return response;
        }
    };

    if !decision.allowed {
        let retry_after_secs = decision.retry_after_secs().unwrap_or(1);
        let mut response = ApiError::from(Error::RateLimited { retry_after_secs }).into_response();
        apply_decision_headers(response.headers_mut(), &decision);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        record_usage(&state, &client.client_id, &endpoint, &method, &response, started);
        return response;
    }

    req.extensions_mut().insert(principal);
    let mut response = next.run(req).await;

    apply_decision_headers(response.headers_mut(), &decision);
    record_usage(&state, &client.client_id, &endpoint, &method, &response, started);

    response
}

fn record_usage(
    state: &AppState,
    client_id: &str,
    endpoint: &str,
    method: &str,
    response: &Response,
    started: Instant,
) {
    state.usage.record(UsageRecord {
        client_id: client_id.to_string(),
        endpoint: endpoint.to_string(),
        method: method.to_string(),
        status_code: response.status().as_u16(),
        latency_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    });
}

fn apply_decision_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (window, usage) in decision.windows() {
        let (limit, remaining, reset) = window_header_names(window);
        headers.insert(HeaderName::from_static(limit), HeaderValue::from(usage.limit));
        headers.insert(
            HeaderName::from_static(remaining),
            HeaderValue::from(usage.remaining),
        );
        headers.insert(
            HeaderName::from_static(reset),
            HeaderValue::from(usage.reset_at.timestamp().max(0) as u64),
        );
    }
}

fn window_header_names(window: Window) -> (&'static str, &'static str, &'static str) {
    match window {
        Window::Minute => (
            "x-ratelimit-minute-limit",
            "x-ratelimit-minute-remaining",
            "x-ratelimit-minute-reset",
        ),
        Window::Hour => (
            "x-ratelimit-hour-limit",
            "x-ratelimit-hour-remaining",
            "x-ratelimit-hour-reset",
        ),
        Window::Day => (
            "x-ratelimit-day-limit",
            "x-ratelimit-day-remaining",
            "x-ratelimit-day-reset",
        ),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn bearer_user(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// First `X-Forwarded-For` entry, falling back to the socket address
fn source_address(req: &Request) -> String {
    if let Some(forwarded) = header_str(req.headers(), "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn client(api_key: &str) -> ClientConfig {
        ClientConfig {
            client_id: "client-a".to_string(),
            api_key: api_key.to_string(),
            limits: RateLimitConfig::default(),
        }
    }

    #[test]
    fn test_registry_resolves_by_key() {
        let registry = ClientRegistry::new(vec![client("key-1")]);

        assert!(registry.resolve("key-1").is_some());
        assert!(registry.resolve("key-2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bearer_user_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_user(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer user-7"));
        assert_eq!(bearer_user(&headers).as_deref(), Some("user-7"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_user(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_user(&headers).is_none());
    }

    #[test]
    fn test_source_address_prefers_forwarded_header() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(source_address(&req), "203.0.113.9");
    }

    #[test]
    fn test_source_address_without_connection_info() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(source_address(&req), "unknown");
    }
}
