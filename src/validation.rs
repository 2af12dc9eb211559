//! Input validation shared by the public and admin endpoints.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SiteError};

/// Message returned when a form is missing fields.
pub const ALL_FIELDS_REQUIRED: &str = "All fields are required";

/// Minimum password length for new accounts.
pub const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$"
    ).expect("Invalid email regex")
});

static SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("Invalid slug regex")
});

/// Trimmed value, or `None` when absent or blank.
pub fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Require every value to be present, failing with `message` otherwise.
pub fn require_all(values: &[Option<&str>], message: &str) -> Result<()> {
    if values.iter().all(|v| present(*v).is_some()) {
        Ok(())
    } else {
        Err(SiteError::Validation(message.to_string()))
    }
}

/// Canonical form emails are stored and compared in.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> Result<()> {
    if email.len() <= 254 && EMAIL_REGEX.is_match(email) {
        Ok(())
    } else {
        Err(SiteError::Validation("Invalid email address".to_string()))
    }
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() >= MIN_PASSWORD_LEN {
        Ok(())
    } else {
        Err(SiteError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )))
    }
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if SLUG_REGEX.is_match(slug) {
        Ok(())
    } else {
        Err(SiteError::Validation(
            "Slug must be lowercase letters, digits and hyphens".to_string(),
        ))
    }
}

/// Derive a URL slug from a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}
