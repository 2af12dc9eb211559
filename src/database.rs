//! SQLite database for persistent storage.
//!
//! Holds accounts, submissions, events, content and the audit log. The
//! connection is owned by a [`DataStore`] handle that connects lazily on
//! first use and is injected into every service.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::OnceCell;

use crate::error::{Result, SiteError};
use crate::lifecycle::{
    ApplicationStatus, ContentStatus, Lifecycle, MessageStatus, SubscriberStatus,
};

/// Format a timestamp the way every table stores it.
///
/// Fixed-width UTC so lexical order matches chronological order in SQL.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SiteError::Database(format!("Invalid timestamp {:?}: {}", value, e)))
}

/// Audit log entry for tracking admin actions.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub user_id: String,
    pub action: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Counters shown on the admin dashboard.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DashboardCounts {
    pub active_subscribers: i64,
    pub unread_messages: i64,
    pub upcoming_events: i64,
    pub content_pending_review: i64,
    pub pending_applications: i64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to a database given a path, `sqlite:` URL or `:memory:`.
    ///
    /// Creates the database file and initializes schema if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        if url == ":memory:" {
            return Self::in_memory().await;
        }

        let options = if url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(url)
                .map_err(|e| SiteError::Database(format!("Invalid database URL: {}", e)))?
                .create_if_missing(true)
        } else {
            let db_path = Path::new(url);

            // Create parent directories if needed
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        SiteError::Database(format!("Failed to create database directory: {}", e))
                    })?;
                }
            }

            SqliteConnectOptions::new()
                .filename(url)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| SiteError::Database(format!("Failed to connect to database: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // A single connection so every query sees the same memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| SiteError::Database(format!("Failed to create in-memory db: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Initialize database schema.
    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| SiteError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SiteError::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }

    // ========== Audit Log ==========

    /// Create an audit log entry.
    pub async fn create_audit_log(
        &self,
        user_id: &str,
        action: &str,
        details: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO audit_log (user_id, action, details, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(action)
        .bind(details)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| SiteError::Database(format!("Failed to create audit log: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    /// Get audit log entries, newest first.
    pub async fn get_audit_logs(&self, limit: u32, offset: u32) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, user_id, action, details, timestamp
             FROM audit_log
             ORDER BY id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SiteError::Database(format!("Failed to get audit logs: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(AuditLogEntry {
                id: row.get("id"),
                user_id: row.get("user_id"),
                action: row.get("action"),
                details: row.get("details"),
                timestamp: parse_timestamp(row.get("timestamp"))?,
            });
        }

        Ok(entries)
    }

    // ========== Dashboard ==========

    /// Collect the admin dashboard counters.
    pub async fn dashboard_counts(&self) -> Result<DashboardCounts> {
        let active_subscribers = self
            .count(
                "SELECT COUNT(*) FROM subscribers WHERE status = ?",
                SubscriberStatus::Active.as_str(),
            )
            .await?;
        let unread_messages = self
            .count(
                "SELECT COUNT(*) FROM contact_messages WHERE status = ?",
                MessageStatus::New.as_str(),
            )
            .await?;
        let upcoming_events = self
            .count(
                "SELECT COUNT(*) FROM events WHERE published = 1 AND starts_at >= ?",
                &timestamp(Utc::now()),
            )
            .await?;
        let content_pending_review = self
            .count(
                "SELECT COUNT(*) FROM content WHERE status = ?",
                ContentStatus::PendingReview.as_str(),
            )
            .await?;
        let pending_applications = self
            .count(
                "SELECT COUNT(*) FROM applications WHERE status = ?",
                ApplicationStatus::Pending.as_str(),
            )
            .await?;

        Ok(DashboardCounts {
            active_subscribers,
            unread_messages,
            upcoming_events,
            content_pending_review,
            pending_applications,
        })
    }

    async fn count(&self, sql: &str, param: &str) -> Result<i64> {
        sqlx::query_scalar(sql)
            .bind(param)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SiteError::Database(format!("Failed to count rows: {}", e)))
    }
}

/// Lazily connected, explicitly owned store handle.
///
/// The first caller of [`DataStore::connection`] establishes the pool.
/// Callers arriving while that connection attempt is in flight get
/// [`SiteError::DatabaseInitializing`] instead of queueing behind it.
pub struct DataStore {
    url: String,
    cell: OnceCell<Database>,
    connecting: AtomicBool,
}

impl DataStore {
    /// Handle that connects to `url` on first use.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cell: OnceCell::new(),
            connecting: AtomicBool::new(false),
        }
    }

    /// Handle around an already connected database.
    pub fn ready(db: Database) -> Self {
        Self {
            url: String::new(),
            cell: OnceCell::new_with(Some(db)),
            connecting: AtomicBool::new(false),
        }
    }

    /// Whether the connection has been established.
    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    /// Get the connection, establishing it if this is the first use.
    pub async fn connection(&self) -> Result<&Database> {
        if let Some(db) = self.cell.get() {
            return Ok(db);
        }

        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(SiteError::DatabaseInitializing);
        }
        // Cleared on every exit, including when the caller drops this future.
        let _connecting = ConnectingGuard(&self.connecting);

        tracing::info!("Connecting to database");
        let db = Database::connect(&self.url).await?;
        tracing::info!("Database connection established");
        Ok(self.cell.get_or_init(|| async move { db }).await)
    }

    /// Close the pool. Later calls to [`DataStore::connection`] fail.
    pub async fn close(&self) {
        if let Some(db) = self.cell.get() {
            db.pool().close().await;
            tracing::info!("Database connection closed");
        }
    }

    /// Mark the handle as mid-connection. Only used to exercise the
    /// initializing path in tests.
    #[cfg(test)]
    pub(crate) fn set_connecting(&self, connecting: bool) {
        self.connecting.store(connecting, Ordering::Release);
    }
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Database schema SQL.
const SCHEMA: &str = r#"
-- Accounts
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member',
    avatar TEXT,
    created_at TEXT NOT NULL
);

-- Contact form submissions
CREATE TABLE IF NOT EXISTS contact_messages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    subject TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    created_at TEXT NOT NULL
);

-- Newsletter subscribers
CREATE TABLE IF NOT EXISTS subscribers (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    subscribed_at TEXT NOT NULL,
    unsubscribed_at TEXT
);

-- Events
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    location TEXT,
    starts_at TEXT NOT NULL,
    ends_at TEXT,
    published INTEGER NOT NULL DEFAULT 1,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_starts_at ON events(starts_at);

-- Articles, talks and other reviewed content
CREATE TABLE IF NOT EXISTS content (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    body TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'article',
    status TEXT NOT NULL DEFAULT 'draft',
    author_id TEXT NOT NULL,
    reviewer_id TEXT,
    review_note TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    published_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_content_status ON content(status);

-- Downloadable resources and links
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    description TEXT,
    category TEXT,
    published INTEGER NOT NULL DEFAULT 1,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Volunteer and teacher applications
CREATE TABLE IF NOT EXISTS applications (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT,
    details TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_applications_kind_status ON applications(kind, status);

-- Email one-time codes
CREATE TABLE IF NOT EXISTS otp_codes (
    email TEXT NOT NULL,
    purpose TEXT NOT NULL,
    code_hash TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (email, purpose)
);

-- Audit log
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL
);
"#;
