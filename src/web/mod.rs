//! HTTP API router and shared handler plumbing.
//!
//! Public endpoints live in [`public`], sign-in flows in [`auth`] and the
//! admin console API in [`admin`]. Static pages are served from the
//! configured directory behind the gatekeeper.

pub mod admin;
pub mod auth;
pub mod public;

use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, FromRef, Request},
    http::{HeaderValue, StatusCode},
    response::Response,
    routing::{any, delete, get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tower_http::services::{ServeDir, ServeFile};

use crate::applications::ApplicationDesk;
use crate::config::SiteConfig;
use crate::contact::ContactInbox;
use crate::content::ContentLibrary;
use crate::database::DataStore;
use crate::error::{ErrorContext, Result, SiteError};
use crate::events::EventCalendar;
use crate::gatekeeper::GatekeeperLayer;
use crate::mailer::Mailer;
use crate::otp::OtpService;
use crate::resources::ResourceShelf;
use crate::session::{SessionResolver, TokenSigner, SESSION_COOKIE};
use crate::subscribers::SubscriberList;
use crate::users::UserDirectory;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request logging middleware layer
#[derive(Clone)]
pub struct RequestLoggingLayer;

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingService { inner }
    }
}

/// Logs every request and tags the response with a request id.
#[derive(Clone)]
pub struct RequestLoggingService<S> {
    inner: S,
}

impl<S> Service<Request> for RequestLoggingService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let start = std::time::Instant::now();

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let status = response.status();

            tracing::info!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                request_id = %request_id,
                "HTTP request"
            );

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

/// Shared handles for every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SiteConfig>,
    pub store: Arc<DataStore>,
    pub signer: Arc<TokenSigner>,
    pub sessions: Arc<SessionResolver>,
    pub otp: Arc<OtpService>,
    pub users: Arc<UserDirectory>,
    pub contact: Arc<ContactInbox>,
    pub subscribers: Arc<SubscriberList>,
    pub events: Arc<EventCalendar>,
    pub content: Arc<ContentLibrary>,
    pub resources: Arc<ResourceShelf>,
    pub applications: Arc<ApplicationDesk>,
}

impl AppState {
    /// Wire every service around one store handle.
    pub fn new(config: SiteConfig, store: Arc<DataStore>, mailer: Arc<dyn Mailer>) -> Self {
        let signer = Arc::new(TokenSigner::new(
            &config.auth_secret,
            chrono::Duration::hours(config.session_ttl_hours),
        ));
        let otp = Arc::new(OtpService::new(
            store.clone(),
            mailer,
            chrono::Duration::minutes(config.otp_ttl_minutes),
            config.otp_max_per_hour,
        ));
        let cache_ttl = Duration::from_secs(config.public_cache_ttl_secs);

        Self {
            sessions: Arc::new(SessionResolver::new(store.clone(), signer.clone())),
            users: Arc::new(UserDirectory::new(store.clone())),
            contact: Arc::new(ContactInbox::new(store.clone())),
            subscribers: Arc::new(SubscriberList::new(store.clone())),
            events: Arc::new(EventCalendar::new(store.clone(), cache_ttl)),
            content: Arc::new(ContentLibrary::new(store.clone(), cache_ttl)),
            resources: Arc::new(ResourceShelf::new(store.clone(), cache_ttl)),
            applications: Arc::new(ApplicationDesk::new(store.clone(), otp.clone())),
            config: Arc::new(config),
            store,
            signer,
            otp,
        }
    }
}

impl FromRef<AppState> for Arc<SessionResolver> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with just a message
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            request_id: None,
        }
    }
}

/// Convert a [`SiteError`] into an API error.
///
/// The error is logged with its context. Clients get the user-facing
/// message; infrastructure errors also carry their stable code and the
/// request id for correlation.
pub fn handle_error(error: SiteError, context: ErrorContext) -> ApiError {
    error.log_with_context(&context);

    let body = if error.exposes_code() {
        ErrorResponse {
            error: error.user_message(),
            code: Some(error.code()),
            request_id: Some(context.request_id),
        }
    } else {
        ErrorResponse::new(error.user_message())
    };

    (error.status(), Json(body))
}

/// Attach handler context to a service result.
pub(crate) trait OrApiError<T> {
    fn or_api(self, context: &ErrorContext) -> std::result::Result<T, ApiError>;
}

impl<T> OrApiError<T> for Result<T> {
    fn or_api(self, context: &ErrorContext) -> std::result::Result<T, ApiError> {
        self.map_err(|err| handle_error(err, context.clone()))
    }
}

/// Unwrap a JSON body, turning extractor rejections into validation errors.
pub(crate) fn read_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected request body");
        SiteError::Validation("Invalid request body".to_string())
    })
}

/// Pagination query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Page {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(50).clamp(1, 100)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// `Set-Cookie` value carrying a session token.
pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value removing the session cookie.
pub fn clear_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

async fn api_not_found() -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("Not found")))
}

pub fn build_router(state: AppState) -> Router {
    let static_dir = Path::new(&state.config.static_dir);
    let serve_dir =
        ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html")));

    let gatekeeper = GatekeeperLayer::new(state.signer.clone());

    Router::new()
        // Accounts
        .route("/api/auth/signup", post(auth::signup))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/session", get(auth::current_session))
        .route("/api/otp/send", post(auth::send_otp))
        // Public site
        .route("/api/health", get(crate::health::health_handler))
        .route("/api/contact", post(public::submit_contact))
        .route("/api/subscribe", post(public::subscribe))
        .route("/api/unsubscribe", post(public::unsubscribe))
        .route("/api/events", get(public::list_events))
        .route("/api/events/{id}", get(public::get_event))
        .route("/api/content", get(public::list_content))
        .route("/api/content/{slug}", get(public::get_content))
        .route("/api/resources", get(public::list_resources))
        .route(
            "/api/applications/volunteer",
            post(public::apply_volunteer),
        )
        .route("/api/applications/teacher", post(public::apply_teacher))
        // Admin console
        .route("/api/admin/stats", get(admin::get_stats))
        .route("/api/admin/subscribers", get(admin::list_subscribers))
        .route(
            "/api/admin/subscribers/{id}",
            delete(admin::delete_subscriber),
        )
        .route("/api/admin/messages", get(admin::list_messages))
        .route(
            "/api/admin/messages/{id}",
            get(admin::get_message).patch(admin::update_message),
        )
        .route(
            "/api/admin/events",
            get(admin::list_events).post(admin::create_event),
        )
        .route(
            "/api/admin/events/{id}",
            put(admin::update_event).delete(admin::delete_event),
        )
        .route(
            "/api/admin/content",
            get(admin::list_content).post(admin::create_content),
        )
        .route(
            "/api/admin/content/{id}",
            get(admin::get_content).put(admin::edit_content),
        )
        .route(
            "/api/admin/content/{id}/submit",
            post(admin::submit_content),
        )
        .route(
            "/api/admin/content/{id}/approve",
            post(admin::approve_content),
        )
        .route(
            "/api/admin/content/{id}/reject",
            post(admin::reject_content),
        )
        .route(
            "/api/admin/content/{id}/unpublish",
            post(admin::unpublish_content),
        )
        .route(
            "/api/admin/resources",
            get(admin::list_resources).post(admin::create_resource),
        )
        .route(
            "/api/admin/resources/{id}",
            delete(admin::delete_resource),
        )
        .route("/api/admin/applications", get(admin::list_applications))
        .route(
            "/api/admin/applications/{id}",
            get(admin::get_application).patch(admin::update_application),
        )
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/{id}/role", patch(admin::update_user_role))
        .route("/api/admin/audit-log", get(admin::get_audit_log))
        .route("/api/{*rest}", any(api_not_found))
        // Static pages, with the SPA entry point for unknown paths
        .fallback_service(serve_dir)
        .layer(gatekeeper)
        .layer(RequestLoggingLayer)
        .with_state(state)
}
