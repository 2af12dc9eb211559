//! Configuration loading from environment.
//!
//! The store location and the token-signing secret are required; everything
//! else has a default suitable for local development.

use std::env;

use crate::error::{Result, SiteError};

/// Minimum accepted length of `AUTH_SECRET` in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Main configuration for the site backend.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// SQLite path or `sqlite:` URL.
    pub database_url: String,
    /// HS256 signing secret for session tokens.
    pub auth_secret: String,
    /// Port the HTTP server binds.
    pub web_port: u16,
    /// Public base URL, used for cookie flags and mail links.
    pub public_url: String,
    /// Directory holding the static pages.
    pub static_dir: String,
    /// Session token lifetime.
    pub session_ttl_hours: i64,
    /// One-time code lifetime.
    pub otp_ttl_minutes: i64,
    /// One-time codes that may be issued per email per hour.
    pub otp_max_per_hour: u32,
    /// Mail delivery endpoint. Mail is only logged when unset.
    pub mail_api_url: Option<String>,
    /// Bearer key for the mail endpoint.
    pub mail_api_key: Option<String>,
    /// Sender address.
    pub mail_from: String,
    /// TTL of the public listing cache.
    pub public_cache_ttl_secs: u64,
}

impl SiteConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DATABASE_URL`: SQLite database path or URL
    /// - `AUTH_SECRET`: session token signing secret (at least 32 bytes)
    ///
    /// Optional environment variables:
    /// - `WEB_PORT` (default: 8080)
    /// - `PUBLIC_URL` (default: http://localhost:8080)
    /// - `STATIC_DIR` (default: web)
    /// - `SESSION_TTL_HOURS` (default: 720)
    /// - `OTP_TTL_MINUTES` (default: 10)
    /// - `OTP_MAX_PER_HOUR` (default: 5)
    /// - `MAIL_API_URL`, `MAIL_API_KEY`, `MAIL_FROM`
    /// - `PUBLIC_CACHE_TTL_SECS` (default: 60)
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| SiteError::Config("DATABASE_URL not set".to_string()))?;

        let auth_secret = env::var("AUTH_SECRET")
            .map_err(|_| SiteError::Config("AUTH_SECRET not set".to_string()))?;

        let config = Self {
            database_url,
            auth_secret,
            web_port: parse_or("WEB_PORT", 8080),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            static_dir: env::var("STATIC_DIR").unwrap_or_else(|_| "web".to_string()),
            session_ttl_hours: parse_or("SESSION_TTL_HOURS", 720),
            otp_ttl_minutes: parse_or("OTP_TTL_MINUTES", 10),
            otp_max_per_hour: parse_or("OTP_MAX_PER_HOUR", 5),
            mail_api_url: non_empty("MAIL_API_URL"),
            mail_api_key: non_empty("MAIL_API_KEY"),
            mail_from: env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@localhost".to_string()),
            public_cache_ttl_secs: parse_or("PUBLIC_CACHE_TTL_SECS", 60),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the service unsafe or unusable.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(SiteError::Config("DATABASE_URL is empty".to_string()));
        }
        if self.auth_secret.len() < MIN_SECRET_LEN {
            return Err(SiteError::Config(format!(
                "AUTH_SECRET must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if self.session_ttl_hours <= 0 || self.otp_ttl_minutes <= 0 {
            return Err(SiteError::Config("TTL values must be positive".to_string()));
        }
        if self.otp_max_per_hour == 0 {
            return Err(SiteError::Config("OTP_MAX_PER_HOUR must be positive".to_string()));
        }
        Ok(())
    }

    /// Whether cookies should carry the `Secure` flag.
    pub fn is_https(&self) -> bool {
        self.public_url.starts_with("https://")
    }

    /// Configuration for tests: in-memory store, fixed secret.
    pub fn for_tests() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            auth_secret: "test-secret-that-is-at-least-32-bytes-long".to_string(),
            web_port: 0,
            public_url: "http://localhost:8080".to_string(),
            static_dir: "web".to_string(),
            session_ttl_hours: 1,
            otp_ttl_minutes: 10,
            otp_max_per_hour: 5,
            mail_api_url: None,
            mail_api_key: None,
            mail_from: "no-reply@localhost".to_string(),
            public_cache_ttl_secs: 60,
        }
    }
}

fn parse_or<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(var_name: &str) -> Option<String> {
    env::var(var_name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_uses_default_when_unset() {
        let var_name = "TEST_SANGHA_PARSE_UNSET_12345";
        env::remove_var(var_name);
        assert_eq!(parse_or(var_name, 42u16), 42);
    }

    #[test]
    fn parse_or_reads_value() {
        let var_name = "TEST_SANGHA_PARSE_SET_12345";
        env::set_var(var_name, " 9090 ");
        assert_eq!(parse_or(var_name, 8080u16), 9090);
        env::remove_var(var_name);
    }

    #[test]
    fn parse_or_ignores_garbage() {
        let var_name = "TEST_SANGHA_PARSE_BAD_12345";
        env::set_var(var_name, "not-a-number");
        assert_eq!(parse_or(var_name, 7i64), 7);
        env::remove_var(var_name);
    }

    #[test]
    fn non_empty_filters_blank() {
        let var_name = "TEST_SANGHA_NON_EMPTY_12345";
        env::set_var(var_name, "   ");
        assert!(non_empty(var_name).is_none());
        env::remove_var(var_name);
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut config = SiteConfig::for_tests();
        config.auth_secret = "short".to_string();
        assert!(matches!(config.validate(), Err(SiteError::Config(_))));
    }

    #[test]
    fn test_config_is_valid() {
        assert!(SiteConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn https_detection() {
        let mut config = SiteConfig::for_tests();
        assert!(!config.is_https());
        config.public_url = "https://example.org".to_string();
        assert!(config.is_https());
    }
}
