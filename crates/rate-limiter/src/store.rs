//! Atomic counter storage backing the rate limiter

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;
use veriflow_common::{Error, Result};

/// One counter to reserve: key, cap, and window length used as the TTL
#[derive(Debug, Clone)]
pub struct CounterEntry {
    pub key: String,
    pub cap: u32,
    pub ttl_secs: u64,
}

/// Observed state of one counter after a reservation attempt
#[derive(Debug, Clone, Copy)]
pub struct CounterState {
    /// Current count. On a granted reservation this includes the increment;
    /// on a denied one it is the untouched pre-check value.
    pub count: u64,

    /// Milliseconds until the counter's window resets
    pub reset_ms: u64,
}

/// Outcome of an all-or-nothing reservation across a set of counters
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Whether every counter was below its cap and all were incremented
    pub granted: bool,

    /// Per-entry counter states, in the order the entries were given
    pub states: Vec<CounterState>,
}

/// Atomic increment-with-expiry storage for rate limit counters.
///
/// `reserve` must be all-or-nothing: if any counter is at its cap, none may
/// be incremented. Concurrent reservations over the same keys must be
/// linearizable, so the number of granted reservations within a window can
/// never exceed the cap.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn reserve(&self, entries: &[CounterEntry]) -> Result<Reservation>;
}

/// Lua script evaluated atomically by Redis: peek every counter, and only if
/// all are below cap commit INCR (with EXPIRE on first hit in the window).
/// Returns a flat array: granted flag, then (count, pttl) per key.
const RESERVE_SCRIPT: &str = r#"
local n = #KEYS
for i = 1, n do
    local cap = tonumber(ARGV[2 * i - 1])
    local count = tonumber(redis.call('GET', KEYS[i]) or '0')
    if count >= cap then
        local out = {0}
        for j = 1, n do
            out[2 * j] = tonumber(redis.call('GET', KEYS[j]) or '0')
            out[2 * j + 1] = redis.call('PTTL', KEYS[j])
        end
        return out
    end
end
local out = {1}
for i = 1, n do
    local count = redis.call('INCR', KEYS[i])
    if count == 1 then
        redis.call('EXPIRE', KEYS[i], tonumber(ARGV[2 * i]))
    end
    out[2 * i] = count
    out[2 * i + 1] = redis.call('PTTL', KEYS[i])
end
return out
"#;

/// Redis-backed counter store
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| Error::Redis(e.to_string()))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        info!("Counter store connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            script: redis::Script::new(RESERVE_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn reserve(&self, entries: &[CounterEntry]) -> Result<Reservation> {
        let mut invocation = self.script.prepare_invoke();
        for entry in entries {
            invocation.key(&entry.key);
            invocation.arg(entry.cap).arg(entry.ttl_secs);
        }

        let mut conn = self.conn.clone();
        let values: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        if values.len() != 1 + 2 * entries.len() {
            return Err(Error::StorageUnavailable(format!(
                "unexpected reservation reply length {}",
                values.len()
            )));
        }

        let granted = values[0] == 1;
        let states = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let count = values[1 + 2 * i].max(0) as u64;
                let pttl = values[2 + 2 * i];
                // PTTL is negative for a missing counter or one without a
                // TTL; report a full window in that case.
                let reset_ms = if pttl > 0 {
                    pttl as u64
                } else {
                    entry.ttl_secs * 1_000
                };
                CounterState { count, reset_ms }
            })
            .collect();

        Ok(Reservation { granted, states })
    }
}

struct Slot {
    count: u64,
    reset_at: Instant,
}

/// In-process counter store for tests and Redis-less development.
///
/// A single mutex spans the check and the commit, giving the same
/// all-or-nothing and no-lost-update guarantees as the Redis script.
#[derive(Default)]
pub struct MemoryCounterStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn reserve(&self, entries: &[CounterEntry]) -> Result<Reservation> {
        let mut slots = self.slots.lock().expect("counter store lock poisoned");
        let now = Instant::now();

        let live_count = |slots: &HashMap<String, Slot>, key: &str| {
            slots
                .get(key)
                .filter(|slot| slot.reset_at > now)
                .map(|slot| slot.count)
                .unwrap_or(0)
        };

        let denied = entries
            .iter()
            .any(|entry| live_count(&slots, &entry.key) >= u64::from(entry.cap));

        if denied {
            let states = entries
                .iter()
                .map(|entry| {
                    let count = live_count(&slots, &entry.key);
                    let reset_ms = slots
                        .get(&entry.key)
                        .filter(|slot| slot.reset_at > now)
                        .map(|slot| slot.reset_at.duration_since(now).as_millis() as u64)
                        .unwrap_or(entry.ttl_secs * 1_000);
                    CounterState { count, reset_ms }
                })
                .collect();

            return Ok(Reservation {
                granted: false,
                states,
            });
        }

        let states = entries
            .iter()
            .map(|entry| {
                let slot = slots.entry(entry.key.clone()).or_insert(Slot {
                    count: 0,
                    reset_at: now,
                });
                if slot.reset_at <= now {
                    slot.count = 0;
                    slot.reset_at = now + Duration::from_secs(entry.ttl_secs);
                }
                slot.count += 1;
                CounterState {
                    count: slot.count,
                    reset_ms: slot.reset_at.duration_since(now).as_millis() as u64,
                }
            })
            .collect();

        Ok(Reservation {
            granted: true,
            states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, cap: u32, ttl_secs: u64) -> CounterEntry {
        CounterEntry {
            key: key.to_string(),
            cap,
            ttl_secs,
        }
    }

    #[tokio::test]
    async fn test_reserve_increments_all_counters() {
        let store = MemoryCounterStore::new();

        let entries = vec![entry("a", 5, 60), entry("b", 5, 3_600)];
        let reservation = store.reserve(&entries).await.unwrap();

        assert!(reservation.granted);
        assert_eq!(reservation.states[0].count, 1);
        assert_eq!(reservation.states[1].count, 1);
    }

    #[tokio::test]
    async fn test_denied_reservation_leaves_counters_untouched() {
        let store = MemoryCounterStore::new();

        // Exhaust counter "a" (cap 1), while "b" has room
        let entries = vec![entry("a", 1, 60), entry("b", 10, 60)];
        assert!(store.reserve(&entries).await.unwrap().granted);

        let denied = store.reserve(&entries).await.unwrap();
        assert!(!denied.granted);
        // "b" must not have been consumed by the denied attempt
        assert_eq!(denied.states[1].count, 1);

        let denied_again = store.reserve(&entries).await.unwrap();
        assert_eq!(denied_again.states[1].count, 1);
    }

    #[tokio::test]
    async fn test_counter_resets_after_window() {
        let store = MemoryCounterStore::new();

        let entries = vec![entry("a", 1, 1)];
        assert!(store.reserve(&entries).await.unwrap().granted);
        assert!(!store.reserve(&entries).await.unwrap().granted);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let after = store.reserve(&entries).await.unwrap();
        assert!(after.granted);
        assert_eq!(after.states[0].count, 1);
    }

    #[tokio::test]
    async fn test_denied_reservation_reports_reset() {
        let store = MemoryCounterStore::new();

        let entries = vec![entry("a", 1, 60)];
        store.reserve(&entries).await.unwrap();

        let denied = store.reserve(&entries).await.unwrap();
        assert!(!denied.granted);
        assert!(denied.states[0].reset_ms > 0);
        assert!(denied.states[0].reset_ms <= 60_000);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_reserve_round_trip() {
        let store = RedisCounterStore::new("redis://127.0.0.1:6379/15")
            .await
            .unwrap();

        let key = format!("test:reserve:{}", std::process::id());
        let entries = vec![entry(&key, 2, 60)];

        assert!(store.reserve(&entries).await.unwrap().granted);
        assert!(store.reserve(&entries).await.unwrap().granted);
        assert!(!store.reserve(&entries).await.unwrap().granted);
    }
}
