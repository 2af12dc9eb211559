//! Institute events: retreats, courses, group sittings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::cache::{CacheStats, ListingCache};
use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::validation::present;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    pub published: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let ends_at: Option<String> = row.get("ends_at");
        Ok(Self {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            location: row.get("location"),
            starts_at: parse_timestamp(row.get("starts_at"))?,
            ends_at: ends_at.as_deref().map(parse_timestamp).transpose()?,
            published: row.get("published"),
            created_by: row.get("created_by"),
            created_at: parse_timestamp(row.get("created_at"))?,
            updated_at: parse_timestamp(row.get("updated_at"))?,
        })
    }
}

/// Event fields as sent by the admin console.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub published: Option<bool>,
}

struct ValidEvent {
    title: String,
    description: String,
    location: Option<String>,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
    published: bool,
}

impl EventDraft {
    fn validate(&self) -> Result<ValidEvent> {
        let (Some(title), Some(starts_at)) = (present(self.title.as_deref()), self.starts_at) else {
            return Err(SiteError::Validation(
                "Title and start time are required".to_string(),
            ));
        };

        if let Some(ends_at) = self.ends_at {
            if ends_at < starts_at {
                return Err(SiteError::Validation(
                    "End time must not be before start time".to_string(),
                ));
            }
        }

        Ok(ValidEvent {
            title: title.to_string(),
            description: present(self.description.as_deref())
                .unwrap_or_default()
                .to_string(),
            location: present(self.location.as_deref()).map(str::to_string),
            starts_at,
            ends_at: self.ends_at,
            published: self.published.unwrap_or(true),
        })
    }
}

const COLUMNS: &str = "id, title, description, location, starts_at, ends_at, published, \
                       created_by, created_at, updated_at";

const UPCOMING_KEY: &str = "upcoming";

pub struct EventCalendar {
    store: Arc<DataStore>,
    cache: ListingCache<Event>,
}

impl EventCalendar {
    pub fn new(store: Arc<DataStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: ListingCache::new(cache_ttl),
        }
    }

    /// Published events that have not started yet, soonest first.
    pub async fn upcoming(&self) -> Result<Arc<Vec<Event>>> {
        self.cache
            .get_or_fetch(UPCOMING_KEY, || async {
                let db = self.store.connection().await?;
                let rows = sqlx::query(&format!(
                    "SELECT {} FROM events
                     WHERE published = 1 AND starts_at >= ?
                     ORDER BY starts_at ASC",
                    COLUMNS
                ))
                .bind(timestamp(Utc::now()))
                .fetch_all(db.pool())
                .await
                .map_err(|e| SiteError::Database(format!("Failed to list events: {}", e)))?;

                rows.iter().map(Event::from_row).collect()
            })
            .await
    }

    async fn find(&self, id: &str) -> Result<Event> {
        let db = self.store.connection().await?;
        let row = sqlx::query(&format!("SELECT {} FROM events WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to get event: {}", e)))?
            .ok_or(SiteError::NotFound("Event"))?;

        Event::from_row(&row)
    }

    /// A single published event.
    pub async fn get_public(&self, id: &str) -> Result<Event> {
        let event = self.find(id).await?;
        if event.published {
            Ok(event)
        } else {
            Err(SiteError::NotFound("Event"))
        }
    }

    /// Every event, newest start first.
    pub async fn list_all(&self, limit: u32, offset: u32) -> Result<Vec<Event>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events ORDER BY starts_at DESC LIMIT ? OFFSET ?",
            COLUMNS
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list events: {}", e)))?;

        rows.iter().map(Event::from_row).collect()
    }

    pub async fn create(&self, draft: &EventDraft, actor_id: &str) -> Result<Event> {
        let valid = draft.validate()?;
        let now = Utc::now();
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            title: valid.title,
            description: valid.description,
            location: valid.location,
            starts_at: valid.starts_at,
            ends_at: valid.ends_at,
            published: valid.published,
            created_by: actor_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        let db = self.store.connection().await?;
        sqlx::query(&format!(
            "INSERT INTO events ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(&event.id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.location.as_deref())
        .bind(timestamp(event.starts_at))
        .bind(event.ends_at.map(timestamp))
        .bind(event.published)
        .bind(&event.created_by)
        .bind(timestamp(event.created_at))
        .bind(timestamp(event.updated_at))
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to create event: {}", e)))?;

        db.create_audit_log(actor_id, "event_created", Some(&format!("event={}", event.id)))
            .await?;
        self.cache.invalidate_all();

        tracing::info!(event_id = %event.id, "Event created");
        Ok(event)
    }

    /// Replace an event's fields.
    pub async fn update(&self, id: &str, draft: &EventDraft, actor_id: &str) -> Result<Event> {
        let valid = draft.validate()?;

        let db = self.store.connection().await?;
        let result = sqlx::query(
            "UPDATE events
             SET title = ?, description = ?, location = ?, starts_at = ?, ends_at = ?,
                 published = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&valid.title)
        .bind(&valid.description)
        .bind(valid.location.as_deref())
        .bind(timestamp(valid.starts_at))
        .bind(valid.ends_at.map(timestamp))
        .bind(valid.published)
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to update event: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(SiteError::NotFound("Event"));
        }

        db.create_audit_log(actor_id, "event_updated", Some(&format!("event={}", id)))
            .await?;
        self.cache.invalidate_all();

        self.find(id).await
    }

    pub async fn delete(&self, id: &str, actor_id: &str) -> Result<()> {
        let db = self.store.connection().await?;
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to delete event: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(SiteError::NotFound("Event"));
        }

        db.create_audit_log(actor_id, "event_deleted", Some(&format!("event={}", id)))
            .await?;
        self.cache.invalidate_all();
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::database::Database;

    async fn calendar() -> EventCalendar {
        let store = Arc::new(DataStore::ready(Database::in_memory().await.unwrap()));
        EventCalendar::new(store, Duration::from_secs(60))
    }

    fn retreat(days_ahead: i64) -> EventDraft {
        let starts_at = Utc::now() + ChronoDuration::days(days_ahead);
        EventDraft {
            title: Some("Silent retreat".to_string()),
            description: Some("Three days of silence".to_string()),
            location: Some("Main hall".to_string()),
            starts_at: Some(starts_at),
            ends_at: Some(starts_at + ChronoDuration::days(3)),
            published: None,
        }
    }

    #[tokio::test]
    async fn title_and_start_are_required() {
        let calendar = calendar().await;
        let err = calendar
            .create(
                &EventDraft {
                    title: Some("   ".to_string()),
                    ..retreat(1)
                },
                "admin-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Validation(_)));

        let err = calendar
            .create(
                &EventDraft {
                    starts_at: None,
                    ..retreat(1)
                },
                "admin-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Validation(_)));
    }

    #[tokio::test]
    async fn end_before_start_rejected() {
        let mut draft = retreat(2);
        draft.ends_at = Some(Utc::now());
        assert!(calendar().await.create(&draft, "admin-1").await.is_err());
    }

    #[tokio::test]
    async fn upcoming_lists_future_published_events() {
        let calendar = calendar().await;
        calendar.create(&retreat(10), "admin-1").await.unwrap();
        calendar.create(&retreat(3), "admin-1").await.unwrap();
        calendar.create(&retreat(-3), "admin-1").await.unwrap();
        calendar
            .create(
                &EventDraft {
                    published: Some(false),
                    ..retreat(5)
                },
                "admin-1",
            )
            .await
            .unwrap();

        let upcoming = calendar.upcoming().await.unwrap();
        assert_eq!(upcoming.len(), 2);
        assert!(upcoming[0].starts_at < upcoming[1].starts_at);
        assert_eq!(calendar.list_all(10, 0).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn writes_invalidate_public_listing() {
        let calendar = calendar().await;
        assert!(calendar.upcoming().await.unwrap().is_empty());

        let event = calendar.create(&retreat(1), "admin-1").await.unwrap();
        assert_eq!(calendar.upcoming().await.unwrap().len(), 1);

        calendar.delete(&event.id, "admin-1").await.unwrap();
        assert!(calendar.upcoming().await.unwrap().is_empty());
        assert!(calendar.cache_stats().misses >= 3);
    }

    #[tokio::test]
    async fn unpublished_events_are_hidden() {
        let calendar = calendar().await;
        let event = calendar
            .create(
                &EventDraft {
                    published: Some(false),
                    ..retreat(1)
                },
                "admin-1",
            )
            .await
            .unwrap();

        assert!(matches!(
            calendar.get_public(&event.id).await,
            Err(SiteError::NotFound("Event"))
        ));

        let updated = calendar
            .update(&event.id, &retreat(1), "admin-1")
            .await
            .unwrap();
        assert!(updated.published);
        assert_eq!(calendar.get_public(&event.id).await.unwrap().id, event.id);
    }

    #[tokio::test]
    async fn missing_event_is_not_found() {
        let calendar = calendar().await;
        assert!(matches!(
            calendar.update("nope", &retreat(1), "admin-1").await,
            Err(SiteError::NotFound(_))
        ));
        assert!(matches!(
            calendar.delete("nope", "admin-1").await,
            Err(SiteError::NotFound(_))
        ));
    }
}
