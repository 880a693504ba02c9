//! Rate limit windows and per-client caps

use serde::{Deserialize, Serialize};

/// Hard per-source-address ceiling for the minute window
pub const SOURCE_CEILING_PER_MINUTE: u32 = 30;

/// Hard per-source-address ceiling for the hour window
pub const SOURCE_CEILING_PER_HOUR: u32 = 500;

/// Hard per-source-address ceiling for the day window
pub const SOURCE_CEILING_PER_DAY: u32 = 5_000;

/// A fixed counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    /// All windows, in ascending order
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    /// Window length in seconds, used as the counter TTL
    pub fn secs(&self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3_600,
            Window::Day => 86_400,
        }
    }

    /// Lowercase name used in counter keys and response headers
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

/// Per-client request caps for each window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1_000,
            requests_per_day: 10_000,
        }
    }
}

impl RateLimitConfig {
    /// Client cap for a window
    pub fn client_cap(&self, window: Window) -> u32 {
        match window {
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
        }
    }

    /// Source-address cap: the client cap bounded by the hard ceiling
    pub fn source_cap(&self, window: Window) -> u32 {
        let ceiling = match window {
            Window::Minute => SOURCE_CEILING_PER_MINUTE,
            Window::Hour => SOURCE_CEILING_PER_HOUR,
            Window::Day => SOURCE_CEILING_PER_DAY,
        };
        self.client_cap(window).min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_secs() {
        assert_eq!(Window::Minute.secs(), 60);
        assert_eq!(Window::Hour.secs(), 3_600);
        assert_eq!(Window::Day.secs(), 86_400);
    }

    #[test]
    fn test_source_cap_bounded_by_ceiling() {
        let config = RateLimitConfig {
            requests_per_minute: 100,
            requests_per_hour: 200,
            requests_per_day: 300,
        };

        assert_eq!(config.source_cap(Window::Minute), 30);
        assert_eq!(config.source_cap(Window::Hour), 200);
        assert_eq!(config.source_cap(Window::Day), 300);
    }

    #[test]
    fn test_source_cap_uses_client_cap_when_lower() {
        let config = RateLimitConfig {
            requests_per_minute: 5,
            requests_per_hour: 50,
            requests_per_day: 500,
        };

        assert_eq!(config.source_cap(Window::Minute), 5);
    }
}
