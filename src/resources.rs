//! Downloadable resources and links shown on the public site.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::cache::ListingCache;
use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::validation::present;

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub published: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.get("id"),
            title: row.get("title"),
            url: row.get("url"),
            description: row.get("description"),
            category: row.get("category"),
            published: row.get("published"),
            created_by: row.get("created_by"),
            created_at: parse_timestamp(row.get("created_at"))?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceDraft {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub published: Option<bool>,
}

/// Absolute http(s) URLs and site-relative paths are accepted.
fn is_acceptable_url(url: &str) -> bool {
    url.starts_with("https://")
        || url.starts_with("http://")
        || (url.starts_with('/') && !url.starts_with("//"))
}

const COLUMNS: &str = "id, title, url, description, category, published, created_by, created_at";

const PUBLIC_KEY: &str = "public";

pub struct ResourceShelf {
    store: Arc<DataStore>,
    cache: ListingCache<Resource>,
}

impl ResourceShelf {
    pub fn new(store: Arc<DataStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: ListingCache::new(cache_ttl),
        }
    }

    /// Published resources grouped by category, then title.
    pub async fn public(&self) -> Result<Arc<Vec<Resource>>> {
        self.cache
            .get_or_fetch(PUBLIC_KEY, || async {
                let db = self.store.connection().await?;
                let rows = sqlx::query(&format!(
                    "SELECT {} FROM resources WHERE published = 1
                     ORDER BY COALESCE(category, ''), title",
                    COLUMNS
                ))
                .fetch_all(db.pool())
                .await
                .map_err(|e| SiteError::Database(format!("Failed to list resources: {}", e)))?;

                rows.iter().map(Resource::from_row).collect()
            })
            .await
    }

    pub async fn list_all(&self, limit: u32, offset: u32) -> Result<Vec<Resource>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM resources ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list resources: {}", e)))?;

        rows.iter().map(Resource::from_row).collect()
    }

    pub async fn create(&self, draft: &ResourceDraft, actor_id: &str) -> Result<Resource> {
        let (Some(title), Some(url)) = (
            present(draft.title.as_deref()),
            present(draft.url.as_deref()),
        ) else {
            return Err(SiteError::Validation(
                "Title and URL are required".to_string(),
            ));
        };
        if !is_acceptable_url(url) {
            return Err(SiteError::Validation("Invalid resource URL".to_string()));
        }

        let resource = Resource {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            url: url.to_string(),
            description: present(draft.description.as_deref()).map(str::to_string),
            category: present(draft.category.as_deref()).map(str::to_lowercase),
            published: draft.published.unwrap_or(true),
            created_by: actor_id.to_string(),
            created_at: Utc::now(),
        };

        let db = self.store.connection().await?;
        sqlx::query(&format!(
            "INSERT INTO resources ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(&resource.id)
        .bind(&resource.title)
        .bind(&resource.url)
        .bind(resource.description.as_deref())
        .bind(resource.category.as_deref())
        .bind(resource.published)
        .bind(&resource.created_by)
        .bind(timestamp(resource.created_at))
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to create resource: {}", e)))?;

        db.create_audit_log(
            actor_id,
            "resource_created",
            Some(&format!("resource={}", resource.id)),
        )
        .await?;
        self.cache.invalidate_all();

        Ok(resource)
    }

    pub async fn delete(&self, id: &str, actor_id: &str) -> Result<()> {
        let db = self.store.connection().await?;
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to delete resource: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(SiteError::NotFound("Resource"));
        }

        db.create_audit_log(actor_id, "resource_deleted", Some(&format!("resource={}", id)))
            .await?;
        self.cache.invalidate_all();
        Ok(())
    }
}
