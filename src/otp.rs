//! Email one-time codes.
//!
//! Used to confirm an address before signup and before a teacher
//! application is accepted. Only a SHA-256 digest of each code is stored,
//! one live code per (email, purpose).

use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::database::{timestamp, DataStore};
use crate::error::{Result, SiteError};
use crate::mailer::{Mailer, OutgoingMail};
use crate::validation::{normalize_email, validate_email};

/// Wrong guesses allowed before a code is burned.
pub const MAX_ATTEMPTS: i64 = 5;

const CODE_LEN: usize = 6;

/// What a code confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    Signup,
    TeacherApplication,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::TeacherApplication => "teacher_application",
        }
    }

    fn subject(&self) -> &'static str {
        match self {
            Self::Signup => "Confirm your email address",
            Self::TeacherApplication => "Confirm your teacher application",
        }
    }
}

fn digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

fn invalid_code() -> SiteError {
    SiteError::Validation("Invalid or expired code".to_string())
}

/// Issues, mails and verifies one-time codes.
pub struct OtpService {
    store: Arc<DataStore>,
    mailer: Arc<dyn Mailer>,
    limiter: DefaultKeyedRateLimiter<String>,
    ttl: Duration,
}

impl OtpService {
    /// Codes live for `ttl`; each email may request `max_per_hour` codes.
    pub fn new(
        store: Arc<DataStore>,
        mailer: Arc<dyn Mailer>,
        ttl: Duration,
        max_per_hour: u32,
    ) -> Self {
        let quota = Quota::per_hour(NonZeroU32::new(max_per_hour).unwrap_or(NonZeroU32::MIN));
        Self::with_quota(store, mailer, ttl, quota)
    }

    fn with_quota(
        store: Arc<DataStore>,
        mailer: Arc<dyn Mailer>,
        ttl: Duration,
        quota: Quota,
    ) -> Self {
        Self {
            store,
            mailer,
            limiter: RateLimiter::keyed(quota),
            ttl,
        }
    }

    /// Forget rate-limit state for emails whose quota has fully replenished.
    ///
    /// Returns the number of emails still tracked.
    pub fn prune_limiter(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Delete codes that expired or ran out of attempts.
    pub async fn purge_stale(&self) -> Result<u64> {
        let db = self.store.connection().await?;
        let result = sqlx::query("DELETE FROM otp_codes WHERE expires_at <= ? OR attempts >= ?")
            .bind(timestamp(Utc::now()))
            .bind(MAX_ATTEMPTS)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to purge codes: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Issue a fresh code for `email`, replacing any previous one, and mail it.
    ///
    /// Returns the expiry of the new code.
    pub async fn issue(&self, email: &str, purpose: OtpPurpose) -> Result<DateTime<Utc>> {
        let email = normalize_email(email);
        validate_email(&email)?;

        if self.limiter.check_key(&email).is_err() {
            tracing::warn!(purpose = purpose.as_str(), "One-time code rate limit hit");
            return Err(SiteError::RateLimited(format!(
                "Too many codes requested for {}",
                email
            )));
        }

        let code = generate_code();
        let now = Utc::now();
        let expires = now + self.ttl;

        let db = self.store.connection().await?;
        sqlx::query(
            "INSERT INTO otp_codes (email, purpose, code_hash, expires_at, attempts, created_at)
             VALUES (?, ?, ?, ?, 0, ?)
             ON CONFLICT(email, purpose) DO UPDATE SET
                code_hash = excluded.code_hash,
                expires_at = excluded.expires_at,
                attempts = 0,
                created_at = excluded.created_at",
        )
        .bind(&email)
        .bind(purpose.as_str())
        .bind(digest(&code))
        .bind(timestamp(expires))
        .bind(timestamp(now))
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to store code: {}", e)))?;

        self.mailer
            .send(OutgoingMail {
                to: email.clone(),
                subject: purpose.subject().to_string(),
                text: format!(
                    "Your verification code is: {}\n\nIt expires in {} minutes.",
                    code,
                    self.ttl.num_minutes()
                ),
            })
            .await?;

        tracing::info!(purpose = purpose.as_str(), "One-time code issued");
        Ok(expires)
    }

    /// Check and consume a code.
    ///
    /// Every guess is charged against the code before it is compared, so
    /// concurrent guesses cannot exceed [`MAX_ATTEMPTS`]. Every failure
    /// looks the same to the caller.
    pub async fn verify(&self, email: &str, purpose: OtpPurpose, code: &str) -> Result<()> {
        let code = code.trim();
        if !is_well_formed(code) {
            return Err(invalid_code());
        }

        let email = normalize_email(email);
        let now = timestamp(Utc::now());
        let db = self.store.connection().await?;
        let charged = sqlx::query(
            "UPDATE otp_codes SET attempts = attempts + 1
             WHERE email = ? AND purpose = ? AND attempts < ? AND expires_at > ?
             RETURNING code_hash",
        )
        .bind(&email)
        .bind(purpose.as_str())
        .bind(MAX_ATTEMPTS)
        .bind(&now)
        .fetch_optional(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to record attempt: {}", e)))?;

        let Some(row) = charged else {
            // Missing, expired or out of attempts
            sqlx::query(
                "DELETE FROM otp_codes
                 WHERE email = ? AND purpose = ? AND (expires_at <= ? OR attempts >= ?)",
            )
            .bind(&email)
            .bind(purpose.as_str())
            .bind(&now)
            .bind(MAX_ATTEMPTS)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to delete code: {}", e)))?;
            return Err(invalid_code());
        };

        let stored: String = row.get("code_hash");
        if !constant_time_eq(&stored, &digest(code)) {
            return Err(invalid_code());
        }

        let consumed = sqlx::query(
            "DELETE FROM otp_codes WHERE email = ? AND purpose = ? AND code_hash = ?",
        )
        .bind(&email)
        .bind(purpose.as_str())
        .bind(&stored)
        .execute(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to delete code: {}", e)))?;

        if consumed.rows_affected() == 0 {
            return Err(invalid_code());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn code_from_mail(mail: &OutgoingMail) -> String {
    mail.text
        .chars()
        .filter(char::is_ascii_digit)
        .take(CODE_LEN)
        .collect()
}
