//! Volunteer and teacher applications.
//!
//! Both kinds share one table. Kind-specific answers are kept as a JSON
//! object in `details`. Teacher applications require a confirmed email.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_timestamp, timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::lifecycle::{check_swap, parse_stored, ApplicationStatus, Lifecycle};
use crate::otp::{OtpPurpose, OtpService};
use crate::validation::{normalize_email, present, require_all, validate_email, ALL_FIELDS_REQUIRED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    Volunteer,
    Teacher,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volunteer => "volunteer",
            Self::Teacher => "teacher",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "volunteer" => Some(Self::Volunteer),
            "teacher" => Some(Self::Teacher),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Application {
    pub id: String,
    pub kind: ApplicationKind,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub details: serde_json::Value,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let kind: String = row.get("kind");
        let details: String = row.get("details");
        Ok(Self {
            id: row.get("id"),
            kind: ApplicationKind::parse(&kind)
                .ok_or_else(|| SiteError::Database(format!("Unknown application kind {:?}", kind)))?,
            name: row.get("name"),
            email: row.get("email"),
            phone: row.get("phone"),
            details: serde_json::from_str(&details)?,
            status: parse_stored(row.get("status"))?,
            created_at: parse_timestamp(row.get("created_at"))?,
            updated_at: parse_timestamp(row.get("updated_at"))?,
        })
    }
}

/// Public volunteer form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolunteerForm {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub interests: Option<String>,
    pub availability: Option<String>,
    pub message: Option<String>,
}

/// Public teacher form. `code` is the emailed one-time code.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeacherForm {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub experience: Option<String>,
    pub tradition: Option<String>,
    pub message: Option<String>,
    pub code: Option<String>,
}

/// Filters for the admin listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationFilter {
    pub kind: Option<ApplicationKind>,
    pub status: Option<ApplicationStatus>,
}

fn optional(value: &Option<String>) -> Option<String> {
    present(value.as_deref()).map(str::to_string)
}

const COLUMNS: &str = "id, kind, name, email, phone, details, status, created_at, updated_at";

pub struct ApplicationDesk {
    store: Arc<DataStore>,
    otp: Arc<OtpService>,
}

impl ApplicationDesk {
    pub fn new(store: Arc<DataStore>, otp: Arc<OtpService>) -> Self {
        Self { store, otp }
    }

    pub async fn submit_volunteer(&self, form: &VolunteerForm) -> Result<Application> {
        require_all(
            &[
                form.name.as_deref(),
                form.email.as_deref(),
                form.interests.as_deref(),
            ],
            ALL_FIELDS_REQUIRED,
        )?;

        let details = serde_json::json!({
            "interests": optional(&form.interests),
            "availability": optional(&form.availability),
            "message": optional(&form.message),
        });

        self.insert(
            ApplicationKind::Volunteer,
            form.name.as_deref(),
            form.email.as_deref(),
            &form.phone,
            details,
        )
        .await
    }

    /// Store a teacher application after consuming its one-time code.
    pub async fn submit_teacher(&self, form: &TeacherForm) -> Result<Application> {
        require_all(
            &[
                form.name.as_deref(),
                form.email.as_deref(),
                form.experience.as_deref(),
                form.code.as_deref(),
            ],
            ALL_FIELDS_REQUIRED,
        )?;
        let email = normalize_email(form.email.as_deref().unwrap_or_default());
        validate_email(&email)?;

        self.otp
            .verify(
                &email,
                OtpPurpose::TeacherApplication,
                form.code.as_deref().unwrap_or_default(),
            )
            .await?;

        let details = serde_json::json!({
            "experience": optional(&form.experience),
            "tradition": optional(&form.tradition),
            "message": optional(&form.message),
            "email_verified": true,
        });

        self.insert(
            ApplicationKind::Teacher,
            form.name.as_deref(),
            Some(&email),
            &form.phone,
            details,
        )
        .await
    }

    async fn insert(
        &self,
        kind: ApplicationKind,
        name: Option<&str>,
        email: Option<&str>,
        phone: &Option<String>,
        details: serde_json::Value,
    ) -> Result<Application> {
        let email = normalize_email(email.unwrap_or_default());
        validate_email(&email)?;

        let now = Utc::now();
        let application = Application {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: present(name).unwrap_or_default().to_string(),
            email,
            phone: optional(phone),
            details,
            status: ApplicationStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let db = self.store.connection().await?;
        sqlx::query(&format!(
            "INSERT INTO applications ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(&application.id)
        .bind(kind.as_str())
        .bind(&application.name)
        .bind(&application.email)
        .bind(application.phone.as_deref())
        .bind(serde_json::to_string(&application.details)?)
        .bind(application.status.as_str())
        .bind(timestamp(now))
        .bind(timestamp(now))
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to save application: {}", e)))?;

        tracing::info!(
            application_id = %application.id,
            kind = kind.as_str(),
            "Application received"
        );
        Ok(application)
    }

    pub async fn get(&self, id: &str) -> Result<Application> {
        let db = self.store.connection().await?;
        let row = sqlx::query(&format!("SELECT {} FROM applications WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to get application: {}", e)))?
            .ok_or(SiteError::NotFound("Application"))?;

        Application::from_row(&row)
    }

    /// Applications newest first.
    pub async fn list(
        &self,
        filter: ApplicationFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Application>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM applications
             WHERE (?1 IS NULL OR kind = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4",
            COLUMNS
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list applications: {}", e)))?;

        rows.iter().map(Application::from_row).collect()
    }

    pub async fn set_status(
        &self,
        id: &str,
        next: ApplicationStatus,
        actor_id: &str,
    ) -> Result<Application> {
        let mut application = self.get(id).await?;
        let from = application.status;
        from.transition_to(next)?;

        let now = Utc::now();
        let db = self.store.connection().await?;
        let result = sqlx::query(
            "UPDATE applications SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(timestamp(now))
        .bind(id)
        .bind(from.as_str())
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to update application: {}", e)))?;
        application.status = check_swap(result.rows_affected(), from, next)?;
        application.updated_at = now;

        db.create_audit_log(
            actor_id,
            "application_status_changed",
            Some(&format!("application={} {}->{}", id, from.as_str(), next.as_str())),
        )
        .await?;

        Ok(application)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::database::Database;
    use crate::mailer::RecordingMailer;
    use crate::otp::code_from_mail;

    struct Fixture {
        desk: ApplicationDesk,
        otp: Arc<OtpService>,
        mailer: Arc<RecordingMailer>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(DataStore::ready(Database::in_memory().await.unwrap()));
        let mailer = Arc::new(RecordingMailer::default());
        let otp = Arc::new(OtpService::new(
            store.clone(),
            mailer.clone(),
            Duration::minutes(10),
            5,
        ));
        Fixture {
            desk: ApplicationDesk::new(store, otp.clone()),
            otp,
            mailer,
        }
    }

    fn volunteer() -> VolunteerForm {
        VolunteerForm {
            name: Some("Ana".to_string()),
            email: Some("ana@example.org".to_string()),
            interests: Some("Kitchen, garden".to_string()),
            ..Default::default()
        }
    }

    fn teacher(code: &str) -> TeacherForm {
        TeacherForm {
            name: Some("Bo".to_string()),
            email: Some("bo@example.org".to_string()),
            experience: Some("Ten years of Vipassana".to_string()),
            code: Some(code.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn volunteer_requires_interests() {
        let f = fixture().await;
        let err = f
            .desk
            .submit_volunteer(&VolunteerForm {
                interests: None,
                ..volunteer()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "All fields are required");

        let app = f.desk.submit_volunteer(&volunteer()).await.unwrap();
        assert_eq!(app.kind, ApplicationKind::Volunteer);
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert_eq!(app.details["interests"], "Kitchen, garden");
    }

    #[tokio::test]
    async fn teacher_needs_valid_code() {
        let f = fixture().await;
        let err = f.desk.submit_teacher(&teacher("123456")).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired code");
        assert!(f
            .desk
            .list(ApplicationFilter::default(), 10, 0)
            .await
            .unwrap()
            .is_empty());

        f.otp
            .issue("bo@example.org", OtpPurpose::TeacherApplication)
            .await
            .unwrap();
        let code = code_from_mail(&f.mailer.last().unwrap());

        let app = f.desk.submit_teacher(&teacher(&code)).await.unwrap();
        assert_eq!(app.kind, ApplicationKind::Teacher);
        assert_eq!(app.details["email_verified"], true);
    }

    #[tokio::test]
    async fn status_changes_follow_lifecycle() {
        let f = fixture().await;
        let app = f.desk.submit_volunteer(&volunteer()).await.unwrap();

        let contacted = f
            .desk
            .set_status(&app.id, ApplicationStatus::Contacted, "admin-1")
            .await
            .unwrap();
        assert_eq!(contacted.status, ApplicationStatus::Contacted);

        f.desk
            .set_status(&app.id, ApplicationStatus::Approved, "admin-1")
            .await
            .unwrap();

        let err = f
            .desk
            .set_status(&app.id, ApplicationStatus::Pending, "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::InvalidTransition { .. }));
        assert_eq!(
            f.desk.get(&app.id).await.unwrap().status,
            ApplicationStatus::Approved
        );
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_status() {
        let f = fixture().await;
        let a = f.desk.submit_volunteer(&volunteer()).await.unwrap();
        f.desk.submit_volunteer(&volunteer()).await.unwrap();
        f.desk
            .set_status(&a.id, ApplicationStatus::Rejected, "admin-1")
            .await
            .unwrap();

        let pending = f
            .desk
            .list(
                ApplicationFilter {
                    kind: Some(ApplicationKind::Volunteer),
                    status: Some(ApplicationStatus::Pending),
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let teachers = f
            .desk
            .list(
                ApplicationFilter {
                    kind: Some(ApplicationKind::Teacher),
                    status: None,
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert!(teachers.is_empty());
    }
}
