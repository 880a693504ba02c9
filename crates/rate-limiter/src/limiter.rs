//! Six-counter rate limit evaluation

use crate::config::{RateLimitConfig, Window};
use crate::store::{CounterEntry, CounterState, CounterStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use veriflow_common::Result;

/// Usage of one window, reported on every gated response
#[derive(Debug, Clone, Copy)]
pub struct WindowUsage {
    /// Configured client cap for this window
    pub limit: u32,

    /// Requests left before the window denies (the more restrictive of the
    /// client and source scopes)
    pub remaining: u32,

    /// When the binding counter's window resets
    pub reset_at: DateTime<Utc>,
}

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub minute: WindowUsage,
    pub hour: WindowUsage,
    pub day: WindowUsage,

    /// On denial, how long the caller must wait for the most restrictive
    /// exceeded counter to reopen
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// Window usages paired with their window, for header emission
    pub fn windows(&self) -> [(Window, &WindowUsage); 3] {
        [
            (Window::Minute, &self.minute),
            (Window::Hour, &self.hour),
            (Window::Day, &self.day),
        ]
    }

    /// `Retry-After` value in whole seconds, rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|d| (d.as_millis() as u64).div_ceil(1_000).max(1))
    }
}

/// Evaluates client and source-address counters over all windows as a single
/// atomic reservation.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check all six counters and consume one request from each, or none.
    ///
    /// Store failures propagate as `StorageUnavailable`; the caller must
    /// treat that as a denial (fail closed), never as an allow.
    pub async fn check_and_consume(
        &self,
        client_key: &str,
        source_key: &str,
        limits: &RateLimitConfig,
    ) -> Result<Decision> {
        // Two entries per window: client first, source second
        let mut entries = Vec::with_capacity(6);
        for window in Window::ALL {
            entries.push(CounterEntry {
                key: format!("ratelimit:client:{}:{}", client_key, window.as_str()),
                cap: limits.client_cap(window),
                ttl_secs: window.secs(),
            });
            entries.push(CounterEntry {
                key: format!("ratelimit:src:{}:{}", source_key, window.as_str()),
                cap: limits.source_cap(window),
                ttl_secs: window.secs(),
            });
        }

        let reservation = self.store.reserve(&entries).await?;
        let now = Utc::now();

        let usage_for = |idx: usize| -> WindowUsage {
            let window = Window::ALL[idx];
            let client = scope_usage(&entries[2 * idx], &reservation.states[2 * idx], now);
            let source = scope_usage(&entries[2 * idx + 1], &reservation.states[2 * idx + 1], now);
            let binding = if source.remaining < client.remaining {
                source
            } else {
                client
            };
            WindowUsage {
                limit: limits.client_cap(window),
                remaining: binding.remaining,
                reset_at: binding.reset_at,
            }
        };

        let minute = usage_for(0);
        let hour = usage_for(1);
        let day = usage_for(2);

        let retry_after = if reservation.granted {
            None
        } else {
            // Most restrictive exceeded counter: the one blocking longest
            let blocking_ms = entries
                .iter()
                .zip(&reservation.states)
                .filter(|(entry, state)| state.count >= u64::from(entry.cap))
                .map(|(_, state)| state.reset_ms)
                .max()
                .unwrap_or(0);

            warn!(
                "Rate limit exceeded for client {} from {} (blocked {}ms)",
                client_key, source_key, blocking_ms
            );

            Some(Duration::from_millis(blocking_ms))
        };

        Ok(Decision {
            allowed: reservation.granted,
            minute,
            hour,
            day,
            retry_after,
        })
    }
}

fn scope_usage(entry: &CounterEntry, state: &CounterState, now: DateTime<Utc>) -> WindowUsage {
    let remaining = u64::from(entry.cap).saturating_sub(state.count) as u32;
    WindowUsage {
        limit: entry.cap,
        remaining,
        reset_at: now + chrono::Duration::milliseconds(state.reset_ms as i64),
    }
}
