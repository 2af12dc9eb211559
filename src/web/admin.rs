//! Admin console API.
//!
//! Every handler takes an [`Authorized`] extractor naming the capability it
//! needs, so a handler body only runs once that check has passed.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{read_body, ApiError, AppState, OrApiError, Page};
use crate::applications::{ApplicationFilter, ApplicationKind};
use crate::content::ContentDraft;
use crate::error::{Result, SiteError};
use crate::events::EventDraft;
use crate::lifecycle::{parse_requested, Lifecycle};
use crate::rbac::{
    Authorized, CanAccessContent, CanCreateContent, CanDeleteSubscriber, CanManageApplications,
    CanManageEvents, CanManageMessages, CanManageResources, CanManageUsers, CanReviewContent,
    CanViewAudit, CanViewMessages, CanViewStats, CanViewSubscribers, CanViewUsers, Role,
};
use crate::resources::ResourceDraft;

type Payload<T> = std::result::Result<Json<T>, JsonRejection>;
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Listing query: pagination plus an optional status filter.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListQuery {
    fn page(&self) -> Page {
        Page {
            limit: self.limit,
            offset: self.offset,
        }
    }

    fn status<L: Lifecycle>(&self) -> Result<Option<L>> {
        self.status.as_deref().map(parse_requested).transpose()
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: String,
}

fn data<T: serde::Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

// ========== Dashboard ==========

/// `GET /api/admin/stats`
pub async fn get_stats(
    auth: Authorized<CanViewStats>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("get_stats");
    let db = state.store.connection().await.or_api(&context)?;
    let counts = db.dashboard_counts().await.or_api(&context)?;

    Ok(Json(json!({
        "data": counts,
        "cache": {
            "events": state.events.cache_stats(),
        },
    })))
}

/// `GET /api/admin/audit-log`
pub async fn get_audit_log(
    auth: Authorized<CanViewAudit>,
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("get_audit_log");
    let db = state.store.connection().await.or_api(&context)?;
    let entries = db
        .get_audit_logs(page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(entries))
}

// ========== Subscribers ==========

/// `GET /api/admin/subscribers`
pub async fn list_subscribers(
    auth: Authorized<CanViewSubscribers>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_subscribers");
    let status = query.status().or_api(&context)?;
    let page = query.page();
    let subscribers = state
        .subscribers
        .list(status, page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(subscribers))
}

/// `DELETE /api/admin/subscribers/{id}`
pub async fn delete_subscriber(
    auth: Authorized<CanDeleteSubscriber>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("delete_subscriber");
    state
        .subscribers
        .delete(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(Json(json!({"message": "Subscriber deleted"})))
}

// ========== Messages ==========

/// `GET /api/admin/messages`
pub async fn list_messages(
    auth: Authorized<CanViewMessages>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_messages");
    let status = query.status().or_api(&context)?;
    let page = query.page();
    let messages = state
        .contact
        .list(status, page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(messages))
}

/// `GET /api/admin/messages/{id}`
pub async fn get_message(
    auth: Authorized<CanViewMessages>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("get_message");
    let message = state.contact.get(&id).await.or_api(&context)?;
    Ok(data(message))
}

/// `PATCH /api/admin/messages/{id}`
pub async fn update_message(
    auth: Authorized<CanManageMessages>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<StatusRequest>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("update_message");
    let request = read_body(payload).or_api(&context)?;
    let next = parse_requested(&request.status).or_api(&context)?;
    let message = state
        .contact
        .set_status(&id, next, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(message))
}

// ========== Events ==========

/// `GET /api/admin/events`
pub async fn list_events(
    auth: Authorized<CanManageEvents>,
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_all_events");
    let events = state
        .events
        .list_all(page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(events))
}

/// `POST /api/admin/events`
pub async fn create_event(
    auth: Authorized<CanManageEvents>,
    State(state): State<AppState>,
    payload: Payload<EventDraft>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = auth.context("create_event");
    let draft = read_body(payload).or_api(&context)?;
    let event = state
        .events
        .create(&draft, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok((StatusCode::CREATED, data(event)))
}

/// `PUT /api/admin/events/{id}`
pub async fn update_event(
    auth: Authorized<CanManageEvents>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<EventDraft>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("update_event");
    let draft = read_body(payload).or_api(&context)?;
    let event = state
        .events
        .update(&id, &draft, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(event))
}

/// `DELETE /api/admin/events/{id}`
pub async fn delete_event(
    auth: Authorized<CanManageEvents>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("delete_event");
    state
        .events
        .delete(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(Json(json!({"message": "Event deleted"})))
}

// ========== Content ==========

/// `GET /api/admin/content`
pub async fn list_content(
    auth: Authorized<CanAccessContent>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_content");
    let status = query.status().or_api(&context)?;
    let page = query.page();
    let items = state
        .content
        .list(status, page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(items))
}

/// `GET /api/admin/content/{id}`
pub async fn get_content(
    auth: Authorized<CanAccessContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("get_content");
    let item = state.content.get(&id).await.or_api(&context)?;
    Ok(data(item))
}

/// `POST /api/admin/content`
pub async fn create_content(
    auth: Authorized<CanCreateContent>,
    State(state): State<AppState>,
    payload: Payload<ContentDraft>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = auth.context("create_content");
    let draft = read_body(payload).or_api(&context)?;
    let item = state
        .content
        .create(&draft, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok((StatusCode::CREATED, data(item)))
}

/// `PUT /api/admin/content/{id}`
pub async fn edit_content(
    auth: Authorized<CanCreateContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<ContentDraft>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("edit_content");
    let draft = read_body(payload).or_api(&context)?;
    let item = state
        .content
        .edit(&id, &draft, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(item))
}

/// `POST /api/admin/content/{id}/submit`
pub async fn submit_content(
    auth: Authorized<CanCreateContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("submit_content");
    let item = state
        .content
        .submit(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(item))
}

/// `POST /api/admin/content/{id}/approve`
pub async fn approve_content(
    auth: Authorized<CanReviewContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("approve_content");
    let item = state
        .content
        .approve(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(item))
}

/// `POST /api/admin/content/{id}/reject`
pub async fn reject_content(
    auth: Authorized<CanReviewContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<RejectRequest>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("reject_content");
    let request = read_body(payload).or_api(&context)?;
    let item = state
        .content
        .reject(&id, &auth.session.id, request.note.as_deref())
        .await
        .or_api(&context)?;
    Ok(data(item))
}

/// `POST /api/admin/content/{id}/unpublish`
pub async fn unpublish_content(
    auth: Authorized<CanReviewContent>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("unpublish_content");
    let item = state
        .content
        .unpublish(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(item))
}

// ========== Resources ==========

/// `GET /api/admin/resources`
pub async fn list_resources(
    auth: Authorized<CanManageResources>,
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_all_resources");
    let resources = state
        .resources
        .list_all(page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(resources))
}

/// `POST /api/admin/resources`
pub async fn create_resource(
    auth: Authorized<CanManageResources>,
    State(state): State<AppState>,
    payload: Payload<ResourceDraft>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let context = auth.context("create_resource");
    let draft = read_body(payload).or_api(&context)?;
    let resource = state
        .resources
        .create(&draft, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok((StatusCode::CREATED, data(resource)))
}

/// `DELETE /api/admin/resources/{id}`
pub async fn delete_resource(
    auth: Authorized<CanManageResources>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("delete_resource");
    state
        .resources
        .delete(&id, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(Json(json!({"message": "Resource deleted"})))
}

// ========== Applications ==========

/// `GET /api/admin/applications`
pub async fn list_applications(
    auth: Authorized<CanManageApplications>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_applications");
    let kind = query
        .kind
        .as_deref()
        .map(|kind| {
            ApplicationKind::parse(kind)
                .ok_or_else(|| SiteError::Validation(format!("Unknown application kind: {}", kind)))
        })
        .transpose()
        .or_api(&context)?;
    let filter = ApplicationFilter {
        kind,
        status: query.status().or_api(&context)?,
    };
    let page = query.page();

    let applications = state
        .applications
        .list(filter, page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(applications))
}

/// `GET /api/admin/applications/{id}`
pub async fn get_application(
    auth: Authorized<CanManageApplications>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("get_application");
    let application = state.applications.get(&id).await.or_api(&context)?;
    Ok(data(application))
}

/// `PATCH /api/admin/applications/{id}`
pub async fn update_application(
    auth: Authorized<CanManageApplications>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<StatusRequest>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("update_application");
    let request = read_body(payload).or_api(&context)?;
    let next = parse_requested(&request.status).or_api(&context)?;
    let application = state
        .applications
        .set_status(&id, next, &auth.session.id)
        .await
        .or_api(&context)?;
    Ok(data(application))
}

// ========== Users ==========

/// `GET /api/admin/users`
pub async fn list_users(
    auth: Authorized<CanViewUsers>,
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("list_users");
    let users = state
        .users
        .list(page.limit(), page.offset())
        .await
        .or_api(&context)?;
    Ok(data(users))
}

/// `PATCH /api/admin/users/{id}/role`
///
/// The new role applies from the user's next sign-in.
pub async fn update_user_role(
    auth: Authorized<CanManageUsers>,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<RoleRequest>,
) -> ApiResult<Json<Value>> {
    let context = auth.context("update_user_role");
    let request = read_body(payload).or_api(&context)?;
    let role = Role::parse(&request.role)
        .ok_or_else(|| SiteError::Validation(format!("Unknown role: {}", request.role)))
        .or_api(&context)?;

    let user = state
        .users
        .set_role(&auth.session.id, &id, role)
        .await
        .or_api(&context)?;
    Ok(data(user))
}
