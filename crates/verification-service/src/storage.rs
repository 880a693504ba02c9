//! Transaction persistence with optimistic concurrency

use crate::models::Transaction;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use veriflow_common::{Error, Result};

/// Persistence for transactions.
///
/// `save` must only commit when the stored version still equals
/// `expected_version`; a stale writer gets `ConcurrencyConflict` and is
/// expected to reload and reapply. History travels inside the serialized
/// transaction, so appends are committed under the same version check.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, txn: &Transaction) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Transaction>>;
    async fn save(&self, txn: &Transaction, expected_version: u64) -> Result<()>;
}

/// Creates the document and version key only if the id is unused
const INSERT_SCRIPT: &str = r#"
if redis.call('SETNX', KEYS[2], ARGV[2]) == 0 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
return 1
"#;

/// Compare-and-set on the version key; commits the document only when the
/// stored version matches the writer's expectation.
const SAVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[2])
if not current then
    return -1
end
if tonumber(current) ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
return 1
"#;

/// Redis-backed transaction store
pub struct RedisTransactionStore {
    conn: ConnectionManager,
    insert_script: redis::Script,
    save_script: redis::Script,
}

impl RedisTransactionStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| Error::Redis(e.to_string()))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        info!("Transaction store connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            insert_script: redis::Script::new(INSERT_SCRIPT),
            save_script: redis::Script::new(SAVE_SCRIPT),
        })
    }

    fn doc_key(id: &str) -> String {
        format!("txn:{}", id)
    }

    fn version_key(id: &str) -> String {
        format!("txn:{}:version", id)
    }
}

#[async_trait]
impl TransactionStore for RedisTransactionStore {
    async fn insert(&self, txn: &Transaction) -> Result<()> {
        let json = serde_json::to_string(txn)?;

        let mut conn = self.conn.clone();
        let created: i64 = self
            .insert_script
            .key(Self::doc_key(&txn.id))
            .key(Self::version_key(&txn.id))
            .arg(&json)
            .arg(txn.version)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        if created == 0 {
            return Err(Error::Validation(format!(
                "transaction {} already exists",
                txn.id
            )));
        }

        debug!("Inserted transaction {}", txn.id);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Transaction>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = redis::cmd("GET")
            .arg(Self::doc_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, txn: &Transaction, expected_version: u64) -> Result<()> {
        let json = serde_json::to_string(txn)?;

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .save_script
            .key(Self::doc_key(&txn.id))
            .key(Self::version_key(&txn.id))
            .arg(expected_version)
            .arg(&json)
            .arg(txn.version)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(e.to_string()))?;

        match outcome {
            1 => {
                debug!("Saved transaction {} at version {}", txn.id, txn.version);
                Ok(())
            }
            0 => Err(Error::ConcurrencyConflict(txn.id.clone())),
            _ => Err(Error::NotFound(txn.id.clone())),
        }
    }
}

/// In-process transaction store for tests and Redis-less development
#[derive(Default)]
pub struct MemoryTransactionStore {
    rows: Mutex<HashMap<String, Transaction>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, txn: &Transaction) -> Result<()> {
        let mut rows = self.rows.lock().expect("transaction store lock poisoned");
        if rows.contains_key(&txn.id) {
            return Err(Error::Validation(format!(
                "transaction {} already exists",
                txn.id
            )));
        }
        rows.insert(txn.id.clone(), txn.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Transaction>> {
        let rows = self.rows.lock().expect("transaction store lock poisoned");
        Ok(rows.get(id).cloned())
    }

    async fn save(&self, txn: &Transaction, expected_version: u64) -> Result<()> {
        let mut rows = self.rows.lock().expect("transaction store lock poisoned");
        match rows.get_mut(&txn.id) {
            None => Err(Error::NotFound(txn.id.clone())),
            Some(stored) if stored.version != expected_version => {
                Err(Error::ConcurrencyConflict(txn.id.clone()))
            }
            Some(stored) => {
                *stored = txn.clone();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TransactionType, VerificationMethod};
    use chrono::Duration;

    fn transaction() -> Transaction {
        Transaction::new(
            "user-1".to_string(),
            TransactionType::Payment,
            100.0,
            "USD".to_string(),
            VerificationMethod::Face,
            Duration::minutes(15),
        )
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = MemoryTransactionStore::new();
        let txn = transaction();

        store.insert(&txn).await.unwrap();

        let loaded = store.load(&txn.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, txn.id);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = MemoryTransactionStore::new();
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = MemoryTransactionStore::new();
        let txn = transaction();

        store.insert(&txn).await.unwrap();
        assert!(store.insert(&txn).await.is_err());
    }

    #[tokio::test]
    async fn test_save_with_matching_version() {
        let store = MemoryTransactionStore::new();
        let mut txn = transaction();
        store.insert(&txn).await.unwrap();

        txn.risk_score = 80;
        txn.version = 2;
        store.save(&txn, 1).await.unwrap();

        let loaded = store.load(&txn.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.risk_score, 80);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = MemoryTransactionStore::new();
        let mut txn = transaction();
        store.insert(&txn).await.unwrap();

        let mut stale = txn.clone();

        txn.version = 2;
        store.save(&txn, 1).await.unwrap();

        stale.risk_score = 10;
        stale.version = 2;
        let result = store.save(&stale, 1).await;

        assert!(matches!(result, Err(Error::ConcurrencyConflict(_))));

        // The losing writer must not have clobbered the winner
        let loaded = store.load(&txn.id).await.unwrap().unwrap();
        assert_eq!(loaded.risk_score, 0);
    }

    #[tokio::test]
    async fn test_save_unknown_id_is_not_found() {
        let store = MemoryTransactionStore::new();
        let txn = transaction();

        let result = store.save(&txn, 1).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
