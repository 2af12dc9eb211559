//! Endpoints used by the public site.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{read_body, ApiError, AppState, OrApiError};
use crate::applications::{TeacherForm, VolunteerForm};
use crate::contact::ContactForm;
use crate::error::{ErrorContext, SiteError};
use crate::subscribers::SubscribeOutcome;
use crate::validation::present;

type Payload<T> = std::result::Result<Json<T>, JsonRejection>;
type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ContactRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeRequest {
    pub email: Option<String>,
    pub name: Option<String>,
}

fn required_email(email: &Option<String>) -> crate::error::Result<&str> {
    present(email.as_deref()).ok_or_else(|| SiteError::Validation("Email is required".to_string()))
}

/// `POST /api/contact`
pub async fn submit_contact(
    State(state): State<AppState>,
    payload: Payload<ContactRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = ErrorContext::new("submit_contact");
    let request = read_body(payload).or_api(&context)?;

    state
        .contact
        .submit(ContactForm {
            name: request.name.as_deref(),
            email: request.email.as_deref(),
            subject: request.subject.as_deref(),
            message: request.message.as_deref(),
        })
        .await
        .or_api(&context)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"message": "Thank you, your message has been sent"})),
    ))
}

/// `POST /api/subscribe`
pub async fn subscribe(
    State(state): State<AppState>,
    payload: Payload<SubscribeRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = ErrorContext::new("subscribe");
    let request = read_body(payload).or_api(&context)?;
    let email = required_email(&request.email).or_api(&context)?;

    let (subscriber, outcome) = state
        .subscribers
        .subscribe(email, present(request.name.as_deref()))
        .await
        .or_api(&context)?;

    let (status, message) = match outcome {
        SubscribeOutcome::Created => (StatusCode::CREATED, "Subscribed successfully"),
        SubscribeOutcome::Reactivated => (StatusCode::OK, "Welcome back, you are subscribed again"),
    };

    Ok((status, Json(json!({"message": message, "data": subscriber}))))
}

/// `POST /api/unsubscribe`
pub async fn unsubscribe(
    State(state): State<AppState>,
    payload: Payload<SubscribeRequest>,
) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("unsubscribe");
    let request = read_body(payload).or_api(&context)?;
    let email = required_email(&request.email).or_api(&context)?;

    let subscriber = state.subscribers.unsubscribe(email).await.or_api(&context)?;

    Ok(Json(json!({
        "message": "You have been unsubscribed",
        "data": subscriber,
    })))
}

/// `GET /api/events`
pub async fn list_events(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("list_events");
    let events = state.events.upcoming().await.or_api(&context)?;
    Ok(Json(json!({"data": events.as_ref()})))
}

/// `GET /api/events/{id}`
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("get_event");
    let event = state.events.get_public(&id).await.or_api(&context)?;
    Ok(Json(json!({"data": event})))
}

/// `GET /api/content`
pub async fn list_content(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("list_content");
    let items = state.content.published().await.or_api(&context)?;
    Ok(Json(json!({"data": items.as_ref()})))
}

/// `GET /api/content/{slug}`
pub async fn get_content(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("get_content");
    let item = state
        .content
        .published_by_slug(&slug)
        .await
        .or_api(&context)?;
    Ok(Json(json!({"data": item})))
}

/// `GET /api/resources`
pub async fn list_resources(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let context = ErrorContext::new("list_resources");
    let resources = state.resources.public().await.or_api(&context)?;
    Ok(Json(json!({"data": resources.as_ref()})))
}

/// `POST /api/applications/volunteer`
pub async fn apply_volunteer(
    State(state): State<AppState>,
    payload: Payload<VolunteerForm>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = ErrorContext::new("apply_volunteer");
    let form = read_body(payload).or_api(&context)?;
    let application = state
        .applications
        .submit_volunteer(&form)
        .await
        .or_api(&context)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Thank you for offering to volunteer, we will be in touch",
            "data": {"id": application.id},
        })),
    ))
}

/// `POST /api/applications/teacher`
pub async fn apply_teacher(
    State(state): State<AppState>,
    payload: Payload<TeacherForm>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = ErrorContext::new("apply_teacher");
    let form = read_body(payload).or_api(&context)?;
    let application = state
        .applications
        .submit_teacher(&form)
        .await
        .or_api(&context)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Your application has been received",
            "data": {"id": application.id},
        })),
    ))
}
