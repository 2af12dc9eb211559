//! Error types for the site backend.
//!
//! All errors are explicitly typed using thiserror. No panics in production code.

use axum::http::StatusCode;
use thiserror::Error;

/// Central error type for all site operations.
#[derive(Debug, Error)]
pub enum SiteError {
    /// Missing or malformed input.
    #[error("{0}")]
    Validation(String),

    /// No valid session on a request that needs one.
    #[error("Unauthorized")]
    Unauthenticated,

    /// Login with an unknown email or a wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Session present but the role lacks the capability.
    #[error("Forbidden: missing capability {capability}")]
    Forbidden {
        /// Capability that was required.
        capability: &'static str,
        /// Status the caller contract expects for this denial.
        status: StatusCode,
    },

    /// Referenced record does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A record lifecycle transition that the transition table forbids.
    #[error("Cannot move {record} from {from} to {to}")]
    InvalidTransition {
        record: &'static str,
        from: &'static str,
        to: &'static str,
    },

    /// Too many requests for a rate-limited operation.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The store handle is still establishing its first connection.
    #[error("Database is initializing")]
    DatabaseInitializing,

    /// Any other store failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Session decoding or resolution failed for a non-store reason.
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error (missing env vars, invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound mail delivery failed.
    #[error("Mail delivery error: {0}")]
    Mail(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything uncategorised.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SiteError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_STATUS",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::DatabaseInitializing => "DATABASE_INITIALIZING",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Session(_) => "SESSION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Mail(_) | Self::Http(_) => "MAIL_ERROR",
            Self::Json(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status suggested for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden { status, .. } => *status,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::DatabaseInitializing | Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Session(_)
            | Self::Config(_)
            | Self::Mail(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log error with full context using tracing.
    pub fn log_with_context(&self, context: &ErrorContext) {
        match self {
            // Critical errors that require immediate attention
            Self::Database(_) | Self::Session(_) | Self::Config(_) | Self::Internal(_) => {
                tracing::error!(
                    error = %self,
                    code = self.code(),
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Critical error occurred"
                );
            }
            Self::DatabaseInitializing | Self::RateLimited(_) => {
                tracing::warn!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Request deferred"
                );
            }
            Self::Mail(_) | Self::Http(_) | Self::Json(_) => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "External service error"
                );
            }
            // Caller mistakes are expected traffic
            Self::Validation(_)
            | Self::Unauthenticated
            | Self::InvalidCredentials
            | Self::Forbidden { .. }
            | Self::NotFound(_)
            | Self::InvalidTransition { .. } => {
                tracing::debug!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Request rejected"
                );
            }
        }
    }

    /// Check if this error is critical and requires alerting.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Session(_) | Self::Config(_) | Self::Internal(_)
        )
    }

    /// Message safe to show to API clients.
    ///
    /// Caller-facing errors carry their own text; infrastructure errors are
    /// replaced by a generic message so internals never leak.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Unauthenticated => "Unauthorized".to_string(),
            Self::InvalidCredentials => self.to_string(),
            Self::Forbidden { status, .. } if *status == StatusCode::UNAUTHORIZED => {
                "Unauthorized".to_string()
            }
            Self::Forbidden { .. } => "Forbidden".to_string(),
            Self::NotFound(_) | Self::InvalidTransition { .. } => self.to_string(),
            Self::RateLimited(_) => "Too many requests, please try again later".to_string(),
            Self::DatabaseInitializing => {
                "Service is starting up, please try again shortly".to_string()
            }
            Self::Database(_) => "Database service temporarily unavailable".to_string(),
            Self::Session(_) => "Could not verify session".to_string(),
            Self::Mail(_) | Self::Http(_) => "Could not send email".to_string(),
            Self::Config(_) | Self::Json(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Whether the response body should expose `code`.
    pub fn exposes_code(&self) -> bool {
        matches!(
            self,
            Self::DatabaseInitializing | Self::Database(_) | Self::Session(_)
        )
    }
}

impl From<sqlx::Error> for SiteError {
    fn from(e: sqlx::Error) -> Self {
        SiteError::Database(e.to_string())
    }
}

/// Context information for error logging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Unique request identifier for correlation
    pub request_id: String,
    /// User ID if available
    pub user_id: Option<String>,
    /// Operation being performed
    pub operation: String,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            operation: operation.into(),
        }
    }

    /// Set user ID
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set request ID
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Result type alias for site operations.
pub type Result<T> = std::result::Result<T, SiteError>;
