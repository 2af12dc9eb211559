//! Contact form inbox.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::lifecycle::{check_swap, parse_stored, Lifecycle, MessageStatus};
use crate::validation::{normalize_email, present, require_all, validate_email, ALL_FIELDS_REQUIRED};

/// A message left through the contact form.
#[derive(Debug, Clone, Serialize)]
pub struct ContactMessage {
    pub id: String,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl ContactMessage {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            subject: row.get("subject"),
            message: row.get("message"),
            status: parse_stored(row.get("status"))?,
            created_at: parse_timestamp(row.get("created_at"))?,
        })
    }
}

/// Contact form fields as submitted.
#[derive(Debug, Clone, Default)]
pub struct ContactForm<'a> {
    pub name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub message: Option<&'a str>,
}

pub struct ContactInbox {
    store: Arc<DataStore>,
}

impl ContactInbox {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Store a submission. Every field is required.
    pub async fn submit(&self, form: ContactForm<'_>) -> Result<ContactMessage> {
        require_all(
            &[form.name, form.email, form.subject, form.message],
            ALL_FIELDS_REQUIRED,
        )?;
        let email = normalize_email(form.email.unwrap_or_default());
        validate_email(&email)?;

        let message = ContactMessage {
            id: uuid::Uuid::new_v4().to_string(),
            name: present(form.name).unwrap_or_default().to_string(),
            email,
            subject: present(form.subject).unwrap_or_default().to_string(),
            message: present(form.message).unwrap_or_default().to_string(),
            status: MessageStatus::New,
            created_at: Utc::now(),
        };

        let db = self.store.connection().await?;
        sqlx::query(
            "INSERT INTO contact_messages (id, name, email, subject, message, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.name)
        .bind(&message.email)
        .bind(&message.subject)
        .bind(&message.message)
        .bind(message.status.as_str())
        .bind(timestamp(message.created_at))
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to save message: {}", e)))?;

        tracing::info!(message_id = %message.id, "Contact message received");
        Ok(message)
    }

    /// Messages newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<MessageStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ContactMessage>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(
            "SELECT id, name, email, subject, message, status, created_at
             FROM contact_messages
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list messages: {}", e)))?;

        rows.iter().map(ContactMessage::from_row).collect()
    }

    pub async fn get(&self, id: &str) -> Result<ContactMessage> {
        let db = self.store.connection().await?;
        let row = sqlx::query(
            "SELECT id, name, email, subject, message, status, created_at
             FROM contact_messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to get message: {}", e)))?
        .ok_or(SiteError::NotFound("Message"))?;

        ContactMessage::from_row(&row)
    }

    /// Move a message to `next` (read or archived).
    pub async fn set_status(
        &self,
        id: &str,
        next: MessageStatus,
        actor_id: &str,
    ) -> Result<ContactMessage> {
        let mut message = self.get(id).await?;
        let from = message.status;
        from.transition_to(next)?;

        let db = self.store.connection().await?;
        let result = sqlx::query("UPDATE contact_messages SET status = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to update message: {}", e)))?;
        message.status = check_swap(result.rows_affected(), from, next)?;

        db.create_audit_log(
            actor_id,
            "message_status_changed",
            Some(&format!("message={} status={}", id, next.as_str())),
        )
        .await?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    async fn inbox() -> ContactInbox {
        ContactInbox::new(Arc::new(DataStore::ready(Database::in_memory().await.unwrap())))
    }

    fn form<'a>() -> ContactForm<'a> {
        ContactForm {
            name: Some("Ana"),
            email: Some("ana@example.org"),
            subject: Some("Retreat"),
            message: Some("Is there space in May?"),
        }
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let inbox = inbox().await;
        let err = inbox
            .submit(ContactForm {
                subject: None,
                ..form()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "All fields are required");
        assert!(inbox.list(None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_email_is_rejected() {
        let err = inbox()
            .await
            .submit(ContactForm {
                email: Some("ana-at-example"),
                ..form()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid email address");
    }

    #[tokio::test]
    async fn submitted_messages_start_new() {
        let inbox = inbox().await;
        let saved = inbox.submit(form()).await.unwrap();
        assert_eq!(saved.status, MessageStatus::New);

        let listed = inbox.list(Some(MessageStatus::New), 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(inbox
            .list(Some(MessageStatus::Archived), 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn status_follows_lifecycle() {
        let inbox = inbox().await;
        let saved = inbox.submit(form()).await.unwrap();

        let read = inbox
            .set_status(&saved.id, MessageStatus::Read, "admin-1")
            .await
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);

        let err = inbox
            .set_status(&saved.id, MessageStatus::New, "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::InvalidTransition { .. }));
        assert_eq!(inbox.get(&saved.id).await.unwrap().status, MessageStatus::Read);

        let err = inbox
            .set_status("missing", MessageStatus::Read, "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::NotFound(_)));
    }
}
