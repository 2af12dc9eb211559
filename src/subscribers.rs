//! Newsletter subscriptions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::lifecycle::{check_swap, parse_stored, Lifecycle, SubscriberStatus};
use crate::validation::{normalize_email, present, validate_email};

#[derive(Debug, Clone, Serialize)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SubscriberStatus,
    pub subscribed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let unsubscribed_at: Option<String> = row.get("unsubscribed_at");
        Ok(Self {
            id: row.get("id"),
            email: row.get("email"),
            name: row.get("name"),
            status: parse_stored(row.get("status"))?,
            subscribed_at: parse_timestamp(row.get("subscribed_at"))?,
            unsubscribed_at: unsubscribed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// How a subscribe request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    Reactivated,
}

const COLUMNS: &str = "id, email, name, status, subscribed_at, unsubscribed_at";

pub struct SubscriberList {
    store: Arc<DataStore>,
}

impl SubscriberList {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        let db = self.store.connection().await?;
        let row = sqlx::query(&format!("SELECT {} FROM subscribers WHERE email = ?", COLUMNS))
            .bind(email)
            .fetch_optional(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to look up subscriber: {}", e)))?;

        row.as_ref().map(Subscriber::from_row).transpose()
    }

    /// Subscribe `email`.
    ///
    /// A previously unsubscribed address is reactivated; an active one is
    /// a validation error.
    pub async fn subscribe(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<(Subscriber, SubscribeOutcome)> {
        let email = normalize_email(email);
        validate_email(&email)?;
        let name = present(name).map(str::to_string);

        if let Some(mut existing) = self.find_by_email(&email).await? {
            let from = existing.status;
            if from == SubscriberStatus::Active {
                return Err(SiteError::Validation(
                    "Email is already subscribed".to_string(),
                ));
            }
            from.transition_to(SubscriberStatus::Active)?;

            let now = Utc::now();
            let db = self.store.connection().await?;
            let result = sqlx::query(
                "UPDATE subscribers
                 SET status = ?, subscribed_at = ?, unsubscribed_at = NULL,
                     name = COALESCE(?, name)
                 WHERE id = ? AND status = ?",
            )
            .bind(SubscriberStatus::Active.as_str())
            .bind(timestamp(now))
            .bind(name.as_deref())
            .bind(&existing.id)
            .bind(from.as_str())
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to reactivate subscriber: {}", e)))?;

            existing.status = check_swap(result.rows_affected(), from, SubscriberStatus::Active)?;
            existing.subscribed_at = now;
            existing.unsubscribed_at = None;
            if name.is_some() {
                existing.name = name;
            }

            tracing::info!(subscriber_id = %existing.id, "Subscriber reactivated");
            return Ok((existing, SubscribeOutcome::Reactivated));
        }

        let subscriber = Subscriber {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            name,
            status: SubscriberStatus::Active,
            subscribed_at: Utc::now(),
            unsubscribed_at: None,
        };

        let db = self.store.connection().await?;
        sqlx::query(
            "INSERT INTO subscribers (id, email, name, status, subscribed_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&subscriber.id)
        .bind(&subscriber.email)
        .bind(subscriber.name.as_deref())
        .bind(subscriber.status.as_str())
        .bind(timestamp(subscriber.subscribed_at))
        .execute(db.pool())
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                SiteError::Validation("Email is already subscribed".to_string())
            }
            _ => SiteError::Database(format!("Failed to add subscriber: {}", e)),
        })?;

        tracing::info!(subscriber_id = %subscriber.id, "Subscriber added");
        Ok((subscriber, SubscribeOutcome::Created))
    }

    /// Unsubscribe `email`. Repeating the request is harmless.
    pub async fn unsubscribe(&self, email: &str) -> Result<Subscriber> {
        let email = normalize_email(email);
        let mut existing = self
            .find_by_email(&email)
            .await?
            .ok_or(SiteError::NotFound("Subscriber"))?;

        let from = existing.status;
        if from == SubscriberStatus::Unsubscribed {
            return Ok(existing);
        }
        from.transition_to(SubscriberStatus::Unsubscribed)?;

        let now = Utc::now();
        let db = self.store.connection().await?;
        let result = sqlx::query(
            "UPDATE subscribers SET status = ?, unsubscribed_at = ? WHERE id = ? AND status = ?",
        )
        .bind(SubscriberStatus::Unsubscribed.as_str())
        .bind(timestamp(now))
        .bind(&existing.id)
        .bind(from.as_str())
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to unsubscribe: {}", e)))?;

        existing.status = check_swap(result.rows_affected(), from, SubscriberStatus::Unsubscribed)?;
        existing.unsubscribed_at = Some(now);

        tracing::info!(subscriber_id = %existing.id, "Subscriber unsubscribed");
        Ok(existing)
    }

    /// Subscribers newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<SubscriberStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Subscriber>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscribers
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY subscribed_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list subscribers: {}", e)))?;

        rows.iter().map(Subscriber::from_row).collect()
    }

    /// Remove a subscriber record entirely.
    pub async fn delete(&self, id: &str, actor_id: &str) -> Result<()> {
        let db = self.store.connection().await?;
        let result = sqlx::query("DELETE FROM subscribers WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to delete subscriber: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(SiteError::NotFound("Subscriber"));
        }

        db.create_audit_log(actor_id, "subscriber_deleted", Some(&format!("subscriber={}", id)))
            .await?;
        Ok(())
    }
}
