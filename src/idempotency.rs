// src/idempotency.rs

//! Deduplication of webhook deliveries by sender-assigned event id.
//!
//! A record means "received and accepted", not "finished": once an event id is
//! accepted, later deliveries inside the retention window are no-ops even if
//! the first processing attempt failed downstream. Failed items go to the
//! dead-letter store instead of relying on sender redelivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{bounded, StoreError};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically records `event_id` unless an unexpired record already
    /// exists. Returns true when this call claimed the id.
    async fn try_claim(
        &self,
        event_id: &str,
        topic: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes expired records. Returns how many were deleted.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Shared store for multi-instance deployments.
#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_claim(
        &self,
        event_id: &str,
        topic: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1));

        // An expired row is re-claimable; a live one makes the upsert a no-op
        // and RETURNING yields nothing.
        let row = sqlx::query(
            r#"INSERT INTO webhook_events (event_id, topic, processed_at, expires_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (event_id) DO UPDATE
                   SET topic = EXCLUDED.topic,
                       processed_at = EXCLUDED.processed_at,
                       expires_at = EXCLUDED.expires_at
                   WHERE webhook_events.expires_at <= EXCLUDED.processed_at
               RETURNING event_id"#,
        )
        .bind(event_id)
        .bind(topic)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Process-local store. Only correct for a single instance; used by tests
/// and local development.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_claim(
        &self,
        event_id: &str,
        _topic: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1));
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| StoreError::Unavailable("idempotency map poisoned".into()))?;
        match seen.get(event_id) {
            Some(existing) if *existing > now => Ok(false),
            _ => {
                seen.insert(event_id.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| StoreError::Unavailable("idempotency map poisoned".into()))?;
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        Ok((before - seen.len()) as u64)
    }
}

/// The guard the orchestrator talks to: a store plus the retention window.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    call_timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            call_timeout,
        }
    }

    /// True the first time `event_id` is seen within the retention window.
    pub async fn accepted(&self, event_id: &str, topic: &str) -> Result<bool, StoreError> {
        self.accepted_at(event_id, topic, Utc::now()).await
    }

    pub async fn accepted_at(
        &self,
        event_id: &str,
        topic: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        bounded(
            "idempotency_claim",
            self.call_timeout,
            self.store.try_claim(event_id, topic, now, self.ttl),
        )
        .await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        bounded(
            "idempotency_purge",
            self.call_timeout,
            self.store.purge_expired(Utc::now()),
        )
        .await
    }
}

/// Periodically deletes expired records; failures are logged and the loop
/// keeps going.
pub fn spawn_purge_task(guard: IdempotencyGuard, every: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            match guard.purge_expired().await {
                Ok(0) => {}
                Ok(n) => log::info!("idempotency purge removed={n}"),
                Err(e) => log::error!("idempotency purge error: {e}"),
            }
        }
    });
}
