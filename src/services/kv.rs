use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Unavailable(e.to_string())
    }
}

/// Shared counter store. Counters are authoritative for the lifetime of
/// their TTL; the relational mirror is only consulted to reseed after
/// eviction.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, KvError>;

    /// Write a counter with a TTL. Used to reseed an evicted bucket.
    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), KvError>;

    /// Atomic increment. The TTL is applied when the increment creates the
    /// key (transition 0 -> 1). Returns the new count.
    async fn incr(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_on_create.as_secs())
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
