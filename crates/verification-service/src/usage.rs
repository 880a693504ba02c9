//! Best-effort usage audit logging

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use veriflow_common::{Error, Result};

/// One gated request, recorded after the response was sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub client_id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only sink for usage records
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> Result<()>;
}

/// Redis sink: one list of JSON records per client
pub struct RedisUsageSink {
    conn: ConnectionManager,
}

impl RedisUsageSink {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| Error::Redis(e.to_string()))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        info!("Usage sink connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

#[async_trait]
impl UsageSink for RedisUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let key = format!("usage:{}", record.client_id);
        let json = serde_json::to_string(record)?;

        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&key, json)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        Ok(())
    }
}

/// In-process sink for tests
#[derive(Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("usage sink lock poisoned").clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        self.records
            .lock()
            .expect("usage sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Fire-and-forget recorder: failures are logged, never propagated to the
/// request path, never retried synchronously.
pub struct UsageRecorder {
    sink: Arc<dyn UsageSink>,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, record: UsageRecord) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.append(&record).await {
                warn!(
                    "Failed to record usage for client {}: {}",
                    record.client_id, e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(client_id: &str) -> UsageRecord {
        UsageRecord {
            client_id: client_id.to_string(),
            endpoint: "/transactions".to_string(),
            method: "POST".to_string(),
            status_code: 201,
            latency_ms: 12,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recorder_appends_asynchronously() {
        let sink = Arc::new(MemoryUsageSink::new());
        let recorder = UsageRecorder::new(Arc::clone(&sink) as Arc<dyn UsageSink>);

        recorder.record(record("client-a"));
        recorder.record(record("client-a"));

        // The spawned tasks need a tick to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sink.records().len(), 2);
    }

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn append(&self, _record: &UsageRecord) -> Result<()> {
            Err(Error::Redis("sink down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let recorder = UsageRecorder::new(Arc::new(FailingSink));

        // Must not panic or propagate
        recorder.record(record("client-a"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
