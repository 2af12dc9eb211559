//! Health check endpoint for deployment platform monitoring.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::database::DataStore;
use crate::error::{ErrorContext, Result};
use crate::web::{handle_error, ApiError, AppState};

/// Body of a healthy response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub build: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<&'static str>,
}

impl HealthReport {
    fn ok() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            build: env!("BUILD_TIMESTAMP"),
            commit: option_env!("GIT_COMMIT"),
        }
    }
}

/// Check that the store answers.
///
/// The first call also establishes the connection, so a deployment probe
/// warms the pool.
pub async fn check(store: &DataStore) -> Result<HealthReport> {
    store.connection().await?.health_check().await?;
    Ok(HealthReport::ok())
}

/// `GET /api/health`
pub async fn health_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthReport>, ApiError> {
    check(&state.store)
        .await
        .map(Json)
        .map_err(|err| handle_error(err, ErrorContext::new("health_check")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::SiteError;

    #[tokio::test]
    async fn ready_store_is_healthy() {
        let store = DataStore::ready(Database::in_memory().await.unwrap());
        let report = check(&store).await.unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
        assert!(!report.build.is_empty());
    }

    #[tokio::test]
    async fn connecting_store_reports_initializing() {
        let store = DataStore::new("sqlite::memory:");
        store.set_connecting(true);
        assert!(matches!(
            check(&store).await,
            Err(SiteError::DatabaseInitializing)
        ));
    }
}
