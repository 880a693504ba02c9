//! Multi-tier rate limiting
//!
//! Every gated request is counted against six counters: the calling client
//! and the source address, each over minute, hour and day windows. The six
//! checks are evaluated as a single reservation against a [`CounterStore`]:
//! either all six counters advance or none does, so a denied request never
//! burns quota on the counters it passed.
//!
//! If the counter store is unreachable the limiter fails closed: the error
//! propagates to the gate, which denies the request instead of letting
//! unbounded traffic through.

pub mod config;
pub mod limiter;
pub mod store;

pub use config::{RateLimitConfig, Window};
pub use limiter::{Decision, RateLimiter, WindowUsage};
pub use store::{CounterEntry, CounterStore, MemoryCounterStore, RedisCounterStore, Reservation};
