//! Sign-up, sign-in and one-time code endpoints.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{clear_cookie, read_body, session_cookie, ApiError, AppState, OrApiError};
use crate::error::{ErrorContext, SiteError};
use crate::otp::OtpPurpose;
use crate::rbac::Role;
use crate::session::{Session, TokenSubject};
use crate::users::{NewUser, User};
use crate::validation::{require_all, ALL_FIELDS_REQUIRED};

type Payload<T> = std::result::Result<Json<T>, JsonRejection>;

#[derive(Debug, Default, Deserialize)]
pub struct SignupRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub email: Option<String>,
    pub purpose: OtpPurpose,
}

/// Issue a token for `user` and wrap it in a `Set-Cookie` value.
fn start_session(state: &AppState, user: &User) -> crate::error::Result<(String, Session)> {
    let (token, expires) = state.signer.issue(&TokenSubject {
        id: &user.id,
        email: &user.email,
        name: &user.name,
        role: user.role,
        avatar: user.avatar.as_deref(),
    })?;

    let cookie = session_cookie(
        &token,
        state.signer.ttl().num_seconds(),
        state.config.is_https(),
    );
    let session = Session {
        id: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        role: user.role,
        avatar: user.avatar.clone(),
        expires,
    };
    Ok((cookie, session))
}

/// `POST /api/otp/send`
pub async fn send_otp(
    State(state): State<AppState>,
    payload: Payload<OtpRequest>,
) -> Result<Json<Value>, ApiError> {
    let context = ErrorContext::new("send_otp");
    let request = read_body(payload).or_api(&context)?;
    let email = request.email.as_deref().unwrap_or_default();
    require_all(&[Some(email)], "Email is required").or_api(&context)?;

    if request.purpose == OtpPurpose::Signup
        && state.users.email_taken(email).await.or_api(&context)?
    {
        return Err(super::handle_error(
            SiteError::Validation("An account with this email already exists".to_string()),
            context,
        ));
    }

    let expires_at = state
        .otp
        .issue(email, request.purpose)
        .await
        .or_api(&context)?;

    Ok(Json(json!({
        "message": "Verification code sent",
        "data": {"expires_at": expires_at},
    })))
}

/// `POST /api/auth/signup`
///
/// Creates a member account once the emailed code checks out, then signs
/// the new member in.
pub async fn signup(
    State(state): State<AppState>,
    payload: Payload<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let context = ErrorContext::new("signup");
    let request = read_body(payload).or_api(&context)?;
    require_all(
        &[
            request.name.as_deref(),
            request.email.as_deref(),
            request.password.as_deref(),
            request.code.as_deref(),
        ],
        ALL_FIELDS_REQUIRED,
    )
    .or_api(&context)?;
    let email = request.email.as_deref().unwrap_or_default();

    state
        .otp
        .verify(
            email,
            OtpPurpose::Signup,
            request.code.as_deref().unwrap_or_default(),
        )
        .await
        .or_api(&context)?;

    let user = state
        .users
        .create(NewUser {
            email,
            name: request.name.as_deref().unwrap_or_default(),
            password: request.password.as_deref().unwrap_or_default(),
            role: Role::Member,
        })
        .await
        .or_api(&context)?;

    let (cookie, session) = start_session(&state, &user).or_api(&context)?;

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(json!({"message": "Account created", "data": session})),
    ))
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<AppState>,
    payload: Payload<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let context = ErrorContext::new("login");
    let request = read_body(payload).or_api(&context)?;
    let (Some(email), Some(password)) = (request.email.as_deref(), request.password.as_deref())
    else {
        return Err(super::handle_error(SiteError::InvalidCredentials, context));
    };

    let user = state
        .users
        .authenticate(email, password)
        .await
        .or_api(&context)?;
    let (cookie, session) = start_session(&state, &user).or_api(&context)?;

    tracing::info!(user_id = %user.id, role = %user.role, "User signed in");

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({"data": session})),
    ))
}

/// `POST /api/auth/logout`
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::SET_COOKIE, clear_cookie(state.config.is_https()))],
        Json(json!({"message": "Signed out"})),
    )
}

/// `GET /api/auth/session`
///
/// The current session, or `null` when signed out.
pub async fn current_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Option<Session>>, ApiError> {
    let context = ErrorContext::new("current_session");
    state
        .sessions
        .resolve(&headers)
        .await
        .map(Json)
        .or_api(&context)
}
