//! Control API
//!
//! REST surface consumed by the chat-bot front end: user enrollment, mailbox
//! create/list/detail/delete, pause/resume, filter and service listings.
//! Handlers stay thin: ownership and lifecycle rules live in the supervisor,
//! persistence in the store, and error phrasing in `errors`.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::models::{
    BotUserIn, BoxFiltersOut, EmailBoxIn, EmailBoxWithFiltersOut, EmailBoxesOut, EmailServicesOut,
    ResponseMessage,
};
use crate::store::Store;
use crate::supervisor::Supervisor;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub supervisor: Supervisor,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(create_user))
        .route("/users/{telegram_id}/exists", get(user_exists))
        .route(
            "/users/{telegram_id}/boxes",
            post(create_box).get(get_user_boxes),
        )
        .route(
            "/users/{telegram_id}/boxes/{box_id}",
            get(get_box).delete(delete_box),
        )
        .route("/users/{telegram_id}/boxes/{box_id}/filters", get(get_filters))
        .route("/users/{telegram_id}/boxes/{box_id}/pause", get(pause_box))
        .route("/users/{telegram_id}/boxes/{box_id}/resume", get(resume_box))
        .route("/services", get(get_services))
        .layer(middleware::from_fn_with_state(state.clone(), check_host))
        .with_state(state)
}

/// Reject requests whose Host header is not in the allow list
async fn check_host(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !host_allowed(&state.config.allowed_hosts, host) {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(next.run(request).await)
}

/// Whether a Host header value matches the configured allow list
fn host_allowed(allowed: &[String], host: &str) -> bool {
    if allowed.iter().any(|h| h == "*") {
        return true;
    }
    let bare = host.split(':').next().unwrap_or_default();
    allowed.iter().any(|h| h == bare)
}

async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<BotUserIn>,
) -> AppResult<(StatusCode, Json<ResponseMessage>)> {
    state.store.create_user(payload.telegram_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ResponseMessage::new("Bot user was successfully created")),
    ))
}

async fn user_exists(
    State(state): State<AppState>,
    Path(telegram_id): Path<i64>,
) -> AppResult<Json<ResponseMessage>> {
    if state.store.user_exists(telegram_id).await? {
        Ok(Json(ResponseMessage::new(format!(
            "Bot user with telegram_id:{telegram_id} exists"
        ))))
    } else {
        Err(AppError::UserNotFound(telegram_id))
    }
}

async fn create_box(
    State(state): State<AppState>,
    Path(telegram_id): Path<i64>,
    Json(payload): Json<EmailBoxIn>,
) -> AppResult<(StatusCode, Json<ResponseMessage>)> {
    state.supervisor.create_box(telegram_id, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(ResponseMessage::new("Email box successfully created")),
    ))
}

async fn get_user_boxes(
    State(state): State<AppState>,
    Path(telegram_id): Path<i64>,
) -> AppResult<Json<EmailBoxesOut>> {
    state.store.get_user(telegram_id).await?;
    let boxes = state.store.user_boxes(telegram_id).await?;
    if boxes.is_empty() {
        return Err(AppError::BoxesNotFound);
    }
    Ok(Json(EmailBoxesOut {
        email_boxes: boxes.into_iter().map(Into::into).collect(),
    }))
}

async fn get_box(
    State(state): State<AppState>,
    Path((telegram_id, box_id)): Path<(i64, i64)>,
) -> AppResult<Json<EmailBoxWithFiltersOut>> {
    let email_box = state.supervisor.owned_box(telegram_id, box_id).await?;
    let filters = state.store.box_filters(box_id).await?;
    Ok(Json(EmailBoxWithFiltersOut {
        id: email_box.id,
        email_service_id: email_box.email_service_id,
        email_username: email_box.email_username,
        is_active: email_box.is_active,
        filters: filters.into_iter().map(Into::into).collect(),
    }))
}

async fn delete_box(
    State(state): State<AppState>,
    Path((telegram_id, box_id)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    state.supervisor.delete_box(telegram_id, box_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_filters(
    State(state): State<AppState>,
    Path((telegram_id, box_id)): Path<(i64, i64)>,
) -> AppResult<Json<BoxFiltersOut>> {
    state.supervisor.owned_box(telegram_id, box_id).await?;
    let filters = state.store.box_filters(box_id).await?;
    if filters.is_empty() {
        return Err(AppError::FiltersNotFound(box_id));
    }
    Ok(Json(BoxFiltersOut {
        filters: filters.into_iter().map(Into::into).collect(),
    }))
}

async fn pause_box(
    State(state): State<AppState>,
    Path((telegram_id, box_id)): Path<(i64, i64)>,
) -> AppResult<Json<ResponseMessage>> {
    state.supervisor.pause_box(telegram_id, box_id).await?;
    Ok(Json(ResponseMessage::new(format!(
        "The user:{telegram_id} box:{box_id} listening was paused"
    ))))
}

async fn resume_box(
    State(state): State<AppState>,
    Path((telegram_id, box_id)): Path<(i64, i64)>,
) -> AppResult<Json<ResponseMessage>> {
    state.supervisor.resume_box(telegram_id, box_id).await?;
    Ok(Json(ResponseMessage::new(format!(
        "The user:{telegram_id} box:{box_id} listening was resumed"
    ))))
}

async fn get_services(State(state): State<AppState>) -> AppResult<Json<EmailServicesOut>> {
    let services = state.store.list_services().await?;
    if services.is_empty() {
        return Err(AppError::ServicesNotAvailable);
    }
    Ok(Json(EmailServicesOut {
        services: services.into_iter().map(Into::into).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::host_allowed;

    #[test]
    fn wildcard_allows_everything() {
        let allowed = vec!["*".to_owned()];
        assert!(host_allowed(&allowed, "relay.example.com"));
        assert!(host_allowed(&allowed, ""));
    }

    #[test]
    fn explicit_hosts_match_with_or_without_port() {
        let allowed = vec!["relay.example.com".to_owned()];
        assert!(host_allowed(&allowed, "relay.example.com"));
        assert!(host_allowed(&allowed, "relay.example.com:8000"));
        assert!(!host_allowed(&allowed, "evil.example.com"));
        assert!(!host_allowed(&allowed, ""));
    }
}
