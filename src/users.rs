//! Site accounts.
//!
//! Passwords are stored as argon2 PHC strings. Roles live on the account
//! row and are copied into the session token at login, so a role change
//! reaches a user with their next token.

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_timestamp, timestamp, DataStore, Database};
use crate::error::{Result, SiteError};
use crate::rbac::Role;
use crate::validation::{normalize_email, validate_email, validate_password};

/// Account as exposed to the admin console. Never carries the hash.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let role: String = row.get("role");
        Ok(Self {
            id: row.get("id"),
            email: row.get("email"),
            name: row.get("name"),
            role: Role::parse(&role).unwrap_or(Role::Member),
            avatar: row.get("avatar"),
            created_at: parse_timestamp(row.get("created_at"))?,
        })
    }
}

/// Input for [`UserDirectory::create`].
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub password: &'a str,
    pub role: Role,
}

/// Whether an account with `id` exists.
pub async fn account_exists(db: &Database, id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
        .bind(id)
        .fetch_one(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to look up account: {}", e)))?;
    Ok(count > 0)
}

fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| SiteError::Internal(format!("Failed to encode salt: {}", e)))?;

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SiteError::Internal(format!("Failed to hash password: {}", e)))
}

fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Stored password hash is malformed");
            false
        }
    }
}

/// Account storage and credential checks.
pub struct UserDirectory {
    store: Arc<DataStore>,
}

impl UserDirectory {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// Create an account. Fails with a validation error on duplicate email.
    pub async fn create(&self, new: NewUser<'_>) -> Result<User> {
        let email = normalize_email(new.email);
        let name = new.name.trim();
        validate_email(&email)?;
        validate_password(new.password)?;
        if name.is_empty() {
            return Err(SiteError::Validation("Name is required".to_string()));
        }

        let db = self.store.connection().await?;
        if self.find_by_email(db, &email).await?.is_some() {
            return Err(duplicate_email());
        }

        let password_hash = hash_password(new.password)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, role, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&email)
        .bind(name)
        .bind(&password_hash)
        .bind(new.role.as_str())
        .bind(timestamp(now))
        .execute(db.pool())
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => duplicate_email(),
            _ => SiteError::Database(format!("Failed to create user: {}", e)),
        })?;

        tracing::info!(user_id = %id, role = %new.role, "Account created");

        Ok(User {
            id,
            email,
            name: name.to_string(),
            role: new.role,
            avatar: None,
            created_at: now,
        })
    }

    /// Whether an account already uses `email`.
    pub async fn email_taken(&self, email: &str) -> Result<bool> {
        let db = self.store.connection().await?;
        Ok(self
            .find_by_email(db, &normalize_email(email))
            .await?
            .is_some())
    }

    /// Check credentials, returning the account on success.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let db = self.store.connection().await?;
        let Some((user, stored)) = self.find_by_email(db, &normalize_email(email)).await? else {
            return Err(SiteError::InvalidCredentials);
        };

        if verify_password(password, &stored) {
            Ok(user)
        } else {
            tracing::debug!(user_id = %user.id, "Password mismatch");
            Err(SiteError::InvalidCredentials)
        }
    }

    async fn find_by_email(&self, db: &Database, email: &str) -> Result<Option<(User, String)>> {
        let row = sqlx::query(
            "SELECT id, email, name, password_hash, role, avatar, created_at
             FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to look up user: {}", e)))?;

        match row {
            Some(row) => Ok(Some((User::from_row(&row)?, row.get("password_hash")))),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: &str) -> Result<User> {
        let db = self.store.connection().await?;
        let row = sqlx::query(
            "SELECT id, email, name, role, avatar, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to get user: {}", e)))?
        .ok_or(SiteError::NotFound("User"))?;

        User::from_row(&row)
    }

    /// List accounts, oldest first.
    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<User>> {
        let db = self.store.connection().await?;
        let rows = sqlx::query(
            "SELECT id, email, name, role, avatar, created_at
             FROM users
             ORDER BY created_at ASC, email ASC
             LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(db.pool())
        .await
        .map_err(|e| SiteError::Database(format!("Failed to list users: {}", e)))?;

        rows.iter().map(User::from_row).collect()
    }

    /// Change another account's role.
    ///
    /// Live sessions keep their role until their token is reissued.
    pub async fn set_role(&self, actor_id: &str, target_id: &str, role: Role) -> Result<User> {
        if actor_id == target_id {
            return Err(SiteError::Validation(
                "You cannot change your own role".to_string(),
            ));
        }

        let db = self.store.connection().await?;
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(target_id)
            .execute(db.pool())
            .await
            .map_err(|e| SiteError::Database(format!("Failed to update role: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(SiteError::NotFound("User"));
        }

        db.create_audit_log(
            actor_id,
            "user_role_changed",
            Some(&format!("user={} role={}", target_id, role)),
        )
        .await?;

        self.get(target_id).await
    }
}

fn duplicate_email() -> SiteError {
    SiteError::Validation("An account with this email already exists".to_string())
}
