// src/dead_letter.rs

//! Durable destination for webhook items that could not be processed.
//!
//! Rows live in the `dead_letters` table until an operator resolves them.
//! When RabbitMQ is configured every new entry is also published to
//! [`DEAD_LETTER_QUEUE`] so external tooling can react; that publish is
//! best-effort and never replaces the table row.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::StoreError;

pub const DEAD_LETTER_QUEUE: &str = "fulfillment.dead_letter";

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

pub fn clamp_page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub event_id: String,
    pub topic: String,
    pub shop_domain: Option<String>,
    /// Product id of the failed line item, or `*` for the whole event.
    pub item_key: String,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub attempt_count: i32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeadLetter {
    pub id: Uuid,
    pub event_id: String,
    pub topic: String,
    pub shop_domain: Option<String>,
    pub item_key: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    fn from_new(entry: NewDeadLetter, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: entry.event_id,
            topic: entry.topic,
            shop_domain: entry.shop_domain,
            item_key: entry.item_key,
            payload: entry.payload,
            failure_reason: entry.failure_reason,
            attempt_count: entry.attempt_count,
            created_at,
            resolved_at: None,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetter, StoreError>;

    /// Unresolved entries, oldest first.
    async fn list_unresolved(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetter>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError>;

    /// Marks an entry resolved. False when it does not exist or was already
    /// resolved.
    async fn resolve(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publishes dead letters to a durable RabbitMQ queue.
pub struct AmqpDeadLetterPublisher {
    _connection: Connection,
    channel: Channel,
}

impl AmqpDeadLetterPublisher {
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                DEAD_LETTER_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    pub async fn publish(&self, entry: &DeadLetter) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(entry)?;
        self.channel
            .basic_publish(
                "",
                DEAD_LETTER_QUEUE,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;
        Ok(())
    }
}

const DEAD_LETTER_COLUMNS: &str = "id, event_id, topic, shop_domain, item_key, payload, \
     failure_reason, attempt_count, created_at, resolved_at";

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    Ok(DeadLetter {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        topic: row.try_get("topic")?,
        shop_domain: row.try_get("shop_domain")?,
        item_key: row.try_get("item_key")?,
        payload: row.try_get("payload")?,
        failure_reason: row.try_get("failure_reason")?,
        attempt_count: row.try_get("attempt_count")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

pub struct PgDeadLetterStore {
    pool: PgPool,
    publisher: Option<Arc<AmqpDeadLetterPublisher>>,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: AmqpDeadLetterPublisher) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterStore {
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        let entry = DeadLetter::from_new(entry, Utc::now());
        sqlx::query(
            r#"INSERT INTO dead_letters
               (id, event_id, topic, shop_domain, item_key, payload, failure_reason, attempt_count, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(entry.id)
        .bind(&entry.event_id)
        .bind(&entry.topic)
        .bind(entry.shop_domain.as_deref())
        .bind(&entry.item_key)
        .bind(&entry.payload)
        .bind(&entry.failure_reason)
        .bind(entry.attempt_count)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        // The row is the record of truth; the queue copy is published off the
        // request path.
        if let Some(publisher) = self.publisher.clone() {
            let published = entry.clone();
            tokio::spawn(async move {
                if let Err(e) = publisher.publish(&published).await {
                    log::warn!("dead letter publish failed id={} error={e}", published.id);
                }
            });
        }
        Ok(entry)
    }

    async fn list_unresolved(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {DEAD_LETTER_COLUMNS}
               FROM dead_letters
               WHERE resolved_at IS NULL
               ORDER BY created_at ASC
               LIMIT $1 OFFSET $2"#
        ))
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn resolve(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE dead_letters
               SET resolved_at = NOW()
               WHERE id = $1 AND resolved_at IS NULL"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local dead letters for tests and local runs.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<DeadLetter>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("dead letter list poisoned".into()))
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterStore {
    async fn push(&self, entry: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        let entry = DeadLetter::from_new(entry, Utc::now());
        self.lock()?.push(entry.clone());
        Ok(entry)
    }

    async fn list_unresolved(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetter>, StoreError> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|e| e.resolved_at.is_none())
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.lock()?.iter().find(|e| e.id == id).cloned())
    }

    async fn resolve(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut entries = self.lock()?;
        match entries.iter_mut().find(|e| e.id == id && e.resolved_at.is_none()) {
            Some(entry) => {
                entry.resolved_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(item_key: &str) -> NewDeadLetter {
        NewDeadLetter {
            event_id: "evt-1".into(),
            topic: "orders/paid".into(),
            shop_domain: Some("shop.test".into()),
            item_key: item_key.into(),
            payload: serde_json::json!({"product_id": item_key}),
            failure_reason: "store timeout".into(),
            attempt_count: 3,
        }
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(clamp_page_limit(None), DEFAULT_PAGE_LIMIT);
        assert_eq!(clamp_page_limit(Some(0)), 1);
        assert_eq!(clamp_page_limit(Some(-5)), 1);
        assert_eq!(clamp_page_limit(Some(500)), MAX_PAGE_LIMIT);
        assert_eq!(clamp_page_limit(Some(20)), 20);
    }

    #[tokio::test]
    async fn resolved_entries_leave_the_unresolved_list() {
        let store = MemoryDeadLetterStore::new();
        let first = store.push(entry("P1")).await.unwrap();
        store.push(entry("P2")).await.unwrap();

        assert_eq!(store.list_unresolved(10, 0).await.unwrap().len(), 2);
        assert!(store.resolve(first.id).await.unwrap());
        assert!(!store.resolve(first.id).await.unwrap());

        let open = store.list_unresolved(10, 0).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].item_key, "P2");

        let fetched = store.get(first.id).await.unwrap().unwrap();
        assert!(fetched.resolved_at.is_some());
    }

    #[tokio::test]
    async fn pagination_skips_and_takes() {
        let store = MemoryDeadLetterStore::new();
        for key in ["P1", "P2", "P3"] {
            store.push(entry(key)).await.unwrap();
        }
        let page = store.list_unresolved(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].item_key, "P2");
    }
}
