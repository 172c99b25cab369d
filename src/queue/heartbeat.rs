//! # Consumer Heartbeats
//!
//! Each consumer periodically records "I was alive at T" in a shared
//! registry ordered by time. Peers read the registry to find consumers whose
//! last beat is too old and reclaim their in-flight tasks.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{EventflowError, Result};

pub const DEFAULT_REGISTRY_KEY: &str = "eventflow:consumers";

#[async_trait]
pub trait HeartbeatRegistry: Send + Sync {
    async fn beat(&self, consumer_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Consumers whose most recent beat is older than `cutoff`.
    async fn dead_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    async fn remove(&self, consumer_id: &str) -> Result<()>;

    async fn last_beat(&self, consumer_id: &str) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, Default)]
pub struct MemoryHeartbeatRegistry {
    beats: Mutex<HashMap<String, DateTime<Utc>>>,
    failures: Mutex<usize>,
}

impl MemoryHeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` beats fail.
    pub fn fail_next_beats(&self, count: usize) {
        *self.failures.lock() = count;
    }
}

#[async_trait]
impl HeartbeatRegistry for MemoryHeartbeatRegistry {
    async fn beat(&self, consumer_id: &str, at: DateTime<Utc>) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(EventflowError::Heartbeat {
                    consumer_id: consumer_id.to_string(),
                    reason: "registry unavailable".to_string(),
                });
            }
        }
        self.beats.lock().insert(consumer_id.to_string(), at);
        Ok(())
    }

    async fn dead_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut dead: Vec<String> = self
            .beats
            .lock()
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        dead.sort();
        Ok(dead)
    }

    async fn remove(&self, consumer_id: &str) -> Result<()> {
        self.beats.lock().remove(consumer_id);
        Ok(())
    }

    async fn last_beat(&self, consumer_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.beats.lock().get(consumer_id).copied())
    }
}

/// Registry on a Redis sorted set: member = consumer ID, score = unix
/// milliseconds of the last beat.
#[derive(Clone)]
pub struct RedisHeartbeatRegistry {
    redis: ConnectionManager,
    key: String,
}

impl std::fmt::Debug for RedisHeartbeatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHeartbeatRegistry")
            .field("key", &self.key)
            .finish()
    }
}

impl RedisHeartbeatRegistry {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EventflowError::queue("heartbeat_connect", e))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| EventflowError::queue("heartbeat_connect", e))?;
        Ok(Self::from_connection(redis, key))
    }

    pub fn from_connection(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }
}

#[async_trait]
impl HeartbeatRegistry for RedisHeartbeatRegistry {
    async fn beat(&self, consumer_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&self.key, consumer_id, at.timestamp_millis())
            .await
            .map_err(|e| EventflowError::Heartbeat {
                consumer_id: consumer_id.to_string(),
                reason: e.to_string(),
            })?;
        debug!(consumer_id, "💓 Heartbeat recorded");
        Ok(())
    }

    async fn dead_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        // Exclusive upper bound: a beat exactly at the cutoff is still alive.
        let max = format!("({}", cutoff.timestamp_millis());
        let dead: Vec<String> = conn.zrangebyscore(&self.key, "-inf", max).await?;
        Ok(dead)
    }

    async fn remove(&self, consumer_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(&self.key, consumer_id).await?;
        Ok(())
    }

    async fn last_beat(&self, consumer_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.clone();
        let score: Option<f64> = conn.zscore(&self.key, consumer_id).await?;
        Ok(score.and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()))
    }
}
