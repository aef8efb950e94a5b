//! Redis-backed expiring key-value store.
//!
//! Short-lived keyed state (webhook replay markers, pending one-time payment
//! state) lives here rather than in process-local maps, so it survives
//! restarts and horizontal scaling.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Redis cache client with connection pooling.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    default_ttl: Duration,
}

impl RedisCache {
    pub async fn new(redis_url: &str, default_ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        tracing::info!("Redis cache connected");

        Ok(Self {
            conn,
            default_ttl: Duration::from_secs(default_ttl_seconds),
        })
    }

    /// Get a value. Cache errors degrade to a miss.
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = key, error = %e, "Failed to deserialize cached value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(key = key, error = %e, "Redis get error");
                None
            }
        }
    }

    /// Set a value with the default TTL.
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    /// Set a value with a custom TTL.
    #[instrument(skip(self, value))]
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();

        let data = serde_json::to_string(value).context("Failed to serialize value for cache")?;

        conn.set_ex::<_, _, ()>(key, data, ttl.as_secs())
            .await
            .context("Failed to set cache value")?;

        debug!(key = key, ttl_secs = ttl.as_secs(), "Cached value");
        Ok(())
    }

    /// Set a key only if absent, with a TTL. Returns whether the key was
    /// set. Used as a cheap replay marker for webhook deliveries.
    #[instrument(skip(self))]
    pub async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<Option<String>>(&mut conn)
            .await
            .map(|reply| reply.is_some())
            .context("Failed to set replay marker")?;

        Ok(set)
    }

    /// Delete a key.
    #[allow(dead_code)]
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let deleted: i32 = conn.del(key).await.context("Failed to delete cache key")?;

        debug!(key = key, deleted = deleted > 0, "Cache delete");
        Ok(deleted > 0)
    }

    /// Check if Redis is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        Ok(())
    }
}

/// Cache key builders for consistent key formats.
#[allow(dead_code)]
pub mod keys {
    /// Replay marker for a delivered webhook event. The first delivery sets
    /// it; redeliveries see it and get logged as replays. Side-effect
    /// idempotency never depends on this marker, only on persisted flags.
    pub fn event_replay(event_name: &str, authorization_reference: &str) -> String {
        format!("event:replay:{authorization_reference}:{event_name}")
    }

    /// Pending one-time payment state for a ride awaiting confirmation.
    pub fn pending_payment(ride_id: uuid::Uuid) -> String {
        format!("payment:pending:{ride_id}")
    }

    /// Cached bid lookup by reference.
    pub fn bid(bid_reference: &str) -> String {
        format!("bid:{bid_reference}")
    }
}
