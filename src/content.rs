//! Articles, talks and other reviewed content.
//!
//! Authors write drafts and submit them; reviewers approve or reject.
//! Every status change goes through [`ContentStatus`]'s transition table and
//! is written with a compare-and-set on the previous status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::cache::ListingCache;
use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::lifecycle::{check_swap, parse_stored, ContentStatus, Lifecycle};
use crate::validation::{present, slugify, validate_slug};

#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub body: String,
    pub kind: String,
    pub status: ContentStatus,
    pub author_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let published_at: Option<String> = row.get("published_at");
        Ok(Self {
            id: row.get("id"),
            title: row.get("title"),
            slug: row.get("slug"),
            body: row.get("body"),
            kind: row.get("kind"),
            status: parse_stored(row.get("status"))?,
            author_id: row.get("author_id"),
            reviewer_id: row.get("reviewer_id"),
            review_note: row.get("review_note"),
            created_at: parse_timestamp(row.get("created_at"))?,
            updated_at: parse_timestamp(row.get("updated_at"))?,
            published_at: published_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Content fields as sent by the admin console.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentDraft {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub body: Option<String>,
    pub kind: Option<String>,
}

struct ValidDraft {
    title: String,
    slug: String,
    body: String,
    kind: String,
}

impl ContentDraft {
    fn validate(&self) -> Result<ValidDraft> {
        let (Some(title), Some(body)) = (
            present(self.title.as_deref()),
            present(self.body.as_deref()),
        ) else {
            return Err(SiteError::Validation(
                "Title and body are required".to_string(),
            ));
        };

        let slug = match present(self.slug.as_deref()) {
            Some(slug) => slug.to_string(),
            None => slugify(title),
        };
        validate_slug(&slug)?;

        Ok(ValidDraft {
            title: title.to_string(),
            slug,
            body: body.to_string(),
            kind: present(self.kind.as_deref())
                .unwrap_or("article")
                .to_lowercase(),
        })
    }
}

const COLUMNS: &str = "id, title, slug, body, kind, status, author_id, reviewer_id, review_note, \
                       created_at, updated_at, published_at";

const PUBLISHED_KEY: &str = "published";

fn slug_taken(e: sqlx::Error, action: &str) -> SiteError {
    match e.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => {
            SiteError::Validation("Slug is already in use".to_string())
        }
        _ => SiteError::Database(format!("Failed to {} content: {}", action, e)),
    }
}

pub struct ContentLibrary {
    store: Arc<DataStore>,
    cache: ListingCache<ContentItem>,
}

impl ContentLibrary {
    pub fn new(store: Arc<DataStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: ListingCache::new(cache_ttl),
        }
    }

    pub async fn get(&self, id: &str) -> Result<ContentItem> {
        let db = self.store.connection().await?;
        let row = sqlx::query(&format!("SELECT {} FROM content WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to get content: {}", e)))?
            .ok_or(SiteError::NotFound("Content"))?;

        ContentItem::from_row(&row)
    }

    /// All content for the admin console, most recently touched first.
    pub async fn list(
        &self,
        status: Option<ContentStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ContentItem>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM content
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list content: {}", e)))?;

        rows.iter().map(ContentItem::from_row).collect()
    }

    /// Published content, newest first.
    pub async fn published(&self) -> Result<Arc<Vec<ContentItem>>> {
        self.cache
            .get_or_fetch(PUBLISHED_KEY, || async {
                let db = self.store.connection().await?;
                let rows = sqlx::query(&format!(
                    "SELECT {} FROM content WHERE status = ? ORDER BY published_at DESC",
                    COLUMNS
                ))
                .bind(ContentStatus::Published.as_str())
                .fetch_all(db.pool())
                .await
                .map_err(|e| SiteError::Database(format!("Failed to list content: {}", e)))?;

                rows.iter().map(ContentItem::from_row).collect()
            })
            .await
    }

    /// A published item by slug.
    pub async fn published_by_slug(&self, slug: &str) -> Result<ContentItem> {
        let db = self.store.connection().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM content WHERE slug = ? AND status = ?",
            COLUMNS
        ))
        .bind(slug)
        .bind(ContentStatus::Published.as_str())
        .fetch_optional(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to get content: {}", e)))?
        .ok_or(SiteError::NotFound("Content"))?;

        ContentItem::from_row(&row)
    }

    /// Create a new draft.
    pub async fn create(&self, draft: &ContentDraft, author_id: &str) -> Result<ContentItem> {
        let valid = draft.validate()?;
        let now = Utc::now();
        let item = ContentItem {
            id: uuid::Uuid::new_v4().to_string(),
            title: valid.title,
            slug: valid.slug,
            body: valid.body,
            kind: valid.kind,
            status: ContentStatus::Draft,
            author_id: author_id.to_string(),
            reviewer_id: None,
            review_note: None,
            created_at: now,
            updated_at: now,
            published_at: None,
        };

        let db = self.store.connection().await?;
        sqlx::query(
            "INSERT INTO content (id, title, slug, body, kind, status, author_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.slug)
        .bind(&item.body)
        .bind(&item.kind)
        .bind(item.status.as_str())
        .bind(&item.author_id)
        .bind(timestamp(item.created_at))
        .bind(timestamp(item.updated_at))
        .execute(db.pool())
        .await
        .map_err(|e| slug_taken(e, "create"))?;

        db.create_audit_log(author_id, "content_created", Some(&format!("content={}", item.id)))
            .await?;

        tracing::info!(content_id = %item.id, "Content draft created");
        Ok(item)
    }

    /// Edit a draft or rejected item. A rejected item goes back to draft.
    pub async fn edit(&self, id: &str, draft: &ContentDraft, actor_id: &str) -> Result<ContentItem> {
        let valid = draft.validate()?;
        let current = self.get(id).await?;
        if !current.status.is_editable() {
            return Err(SiteError::Validation(format!(
                "Content in status {} cannot be edited",
                current.status.as_str()
            )));
        }
        let next = match current.status {
            ContentStatus::Rejected => current.status.transition_to(ContentStatus::Draft)?,
            status => status,
        };

        let db = self.store.connection().await?;
        let result = sqlx::query(
            "UPDATE content SET title = ?, slug = ?, body = ?, kind = ?, status = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(&valid.title)
        .bind(&valid.slug)
        .bind(&valid.body)
        .bind(&valid.kind)
        .bind(next.as_str())
        .bind(timestamp(Utc::now()))
        .bind(id)
        .bind(current.status.as_str())
        .execute(db.pool())
        .await
        .map_err(|e| slug_taken(e, "update"))?;
        check_swap(result.rows_affected(), current.status, next)?;

        db.create_audit_log(actor_id, "content_edited", Some(&format!("content={}", id)))
            .await?;
        self.get(id).await
    }

    /// Submit a draft (or rejected item) for review.
    pub async fn submit(&self, id: &str, actor_id: &str) -> Result<ContentItem> {
        self.transition(id, None, ContentStatus::PendingReview, actor_id, None)
            .await
    }

    /// Publish an item that is pending review.
    pub async fn approve(&self, id: &str, reviewer_id: &str) -> Result<ContentItem> {
        self.transition(id, None, ContentStatus::Published, reviewer_id, None)
            .await
    }

    /// Send an item back to its author with a reason.
    pub async fn reject(&self, id: &str, reviewer_id: &str, note: Option<&str>) -> Result<ContentItem> {
        let Some(note) = present(note) else {
            return Err(SiteError::Validation(
                "A reason is required to reject content".to_string(),
            ));
        };
        self.transition(id, None, ContentStatus::Rejected, reviewer_id, Some(note))
            .await
    }

    /// Take a published item back to draft.
    ///
    /// Only `published` items qualify; a rejected item goes back to draft
    /// through an edit, not through this.
    pub async fn unpublish(&self, id: &str, reviewer_id: &str) -> Result<ContentItem> {
        self.transition(
            id,
            Some(ContentStatus::Published),
            ContentStatus::Draft,
            reviewer_id,
            None,
        )
        .await
    }

    /// Move `id` to `next`. With `only_from`, any other current status is
    /// refused even when the table would allow the move.
    async fn transition(
        &self,
        id: &str,
        only_from: Option<ContentStatus>,
        next: ContentStatus,
        actor_id: &str,
        note: Option<&str>,
    ) -> Result<ContentItem> {
        let mut item = self.get(id).await?;
        let from = item.status;
        if only_from.is_some_and(|required| required != from) {
            return Err(SiteError::InvalidTransition {
                record: ContentStatus::RECORD,
                from: from.as_str(),
                to: next.as_str(),
            });
        }
        from.transition_to(next)?;

        let now = Utc::now();
        match next {
            ContentStatus::Published => {
                item.reviewer_id = Some(actor_id.to_string());
                item.review_note = None;
                item.published_at = Some(now);
            }
            ContentStatus::Rejected => {
                item.reviewer_id = Some(actor_id.to_string());
                item.review_note = note.map(str::to_string);
            }
            ContentStatus::Draft => item.published_at = None,
            ContentStatus::PendingReview => {}
        }
        item.updated_at = now;

        let db = self.store.connection().await?;
        let result = sqlx::query(
            "UPDATE content
             SET status = ?, reviewer_id = ?, review_note = ?, published_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(item.reviewer_id.as_deref())
        .bind(item.review_note.as_deref())
        .bind(item.published_at.map(timestamp))
        .bind(timestamp(now))
        .bind(id)
        .bind(from.as_str())
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to update content: {}", e)))?;
        item.status = check_swap(result.rows_affected(), from, next)?;

        db.create_audit_log(
            actor_id,
            "content_status_changed",
            Some(&format!("content={} {}->{}", id, from.as_str(), next.as_str())),
        )
        .await?;

        if from == ContentStatus::Published || next == ContentStatus::Published {
            self.cache.invalidate_all();
        }

        tracing::info!(
            content_id = %id,
            from = from.as_str(),
            to = next.as_str(),
            "Content status changed"
        );
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;

    use super::*;
    use crate::database::Database;

    async fn library() -> ContentLibrary {
        let store = Arc::new(DataStore::ready(Database::in_memory().await.unwrap()));
        ContentLibrary::new(store, Duration::from_secs(60))
    }

    fn draft(title: &str) -> ContentDraft {
        ContentDraft {
            title: Some(title.to_string()),
            slug: None,
            body: Some("Sit. Breathe. Notice.".to_string()),
            kind: None,
        }
    }

    #[tokio::test]
    async fn create_derives_slug() {
        let library = library().await;
        let item = library.create(&draft("Walking Meditation"), "author-1").await.unwrap();
        assert_eq!(item.slug, "walking-meditation");
        assert_eq!(item.status, ContentStatus::Draft);
        assert_eq!(item.kind, "article");

        let err = library
            .create(&draft("Walking meditation!"), "author-1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Slug is already in use");
    }

    #[tokio::test]
    async fn approve_requires_pending_review() {
        let library = library().await;
        let item = library.create(&draft("Draft only"), "author-1").await.unwrap();

        let err = library.approve(&item.id, "reviewer-1").await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let unchanged = library.get(&item.id).await.unwrap();
        assert_eq!(unchanged.status, ContentStatus::Draft);
        assert!(unchanged.reviewer_id.is_none());
        assert_eq!(unchanged.updated_at, item.updated_at.with_nanosecond(0).unwrap());
    }

    #[tokio::test]
    async fn full_review_cycle() {
        let library = library().await;
        let item = library.create(&draft("On Patience"), "author-1").await.unwrap();

        let pending = library.submit(&item.id, "author-1").await.unwrap();
        assert_eq!(pending.status, ContentStatus::PendingReview);

        let rejected = library
            .reject(&item.id, "reviewer-1", Some("Needs sources"))
            .await
            .unwrap();
        assert_eq!(rejected.status, ContentStatus::Rejected);
        assert_eq!(rejected.review_note.as_deref(), Some("Needs sources"));

        let edited = library
            .edit(&item.id, &draft("On Patience"), "author-1")
            .await
            .unwrap();
        assert_eq!(edited.status, ContentStatus::Draft);
        assert_eq!(edited.review_note.as_deref(), Some("Needs sources"));
        library.submit(&item.id, "author-1").await.unwrap();

        let published = library.approve(&item.id, "reviewer-1").await.unwrap();
        assert_eq!(published.status, ContentStatus::Published);
        assert!(published.published_at.is_some());
        assert!(published.review_note.is_none());

        assert_eq!(library.published().await.unwrap().len(), 1);
        assert_eq!(
            library.published_by_slug("on-patience").await.unwrap().id,
            item.id
        );

        library.unpublish(&item.id, "reviewer-1").await.unwrap();
        assert!(library.published().await.unwrap().is_empty());
        assert!(matches!(
            library.published_by_slug("on-patience").await,
            Err(SiteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unpublish_only_applies_to_published_items() {
        let library = library().await;
        let item = library.create(&draft("Not yet"), "author-1").await.unwrap();
        library.submit(&item.id, "author-1").await.unwrap();
        let rejected = library
            .reject(&item.id, "reviewer-1", Some("Too short"))
            .await
            .unwrap();

        let err = library.unpublish(&item.id, "reviewer-1").await.unwrap_err();
        assert!(matches!(err, SiteError::InvalidTransition { .. }));
        assert_eq!(err.status().as_u16(), 400);

        let unchanged = library.get(&item.id).await.unwrap();
        assert_eq!(unchanged.status, ContentStatus::Rejected);
        assert_eq!(unchanged.review_note.as_deref(), Some("Too short"));
        assert_eq!(unchanged.updated_at, rejected.updated_at.with_nanosecond(0).unwrap());

        let draft_item = library.create(&draft("Still a draft"), "author-1").await.unwrap();
        assert!(library.unpublish(&draft_item.id, "reviewer-1").await.is_err());
    }

    #[tokio::test]
    async fn pending_content_is_locked() {
        let library = library().await;
        let item = library.create(&draft("Locked"), "author-1").await.unwrap();
        library.submit(&item.id, "author-1").await.unwrap();

        let err = library
            .edit(&item.id, &draft("Locked edit"), "author-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Validation(_)));
        assert_eq!(library.get(&item.id).await.unwrap().title, "Locked");
    }

    #[tokio::test]
    async fn reject_needs_reason() {
        let library = library().await;
        let item = library.create(&draft("Reasons"), "author-1").await.unwrap();
        library.submit(&item.id, "author-1").await.unwrap();

        assert!(library.reject(&item.id, "reviewer-1", Some("  ")).await.is_err());
        assert_eq!(
            library.get(&item.id).await.unwrap().status,
            ContentStatus::PendingReview
        );
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let library = library().await;
        let a = library.create(&draft("First"), "author-1").await.unwrap();
        library.create(&draft("Second"), "author-1").await.unwrap();
        library.submit(&a.id, "author-1").await.unwrap();

        let pending = library
            .list(Some(ContentStatus::PendingReview), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(library.list(None, 10, 0).await.unwrap().len(), 2);
    }
}

