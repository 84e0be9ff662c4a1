//! Core terminals. Every one runs after the route's plugin middleware.

use askama::Template;
use axum::http::header;
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use domains::{ContentKind, DomainError, RawSubmission};
use serde_json::json;
use services::plugins::PluginRequest;
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::pages::PageShell;

/// Form field carrying a moderator's signature request.
pub const MODERATOR_FIELD: &str = "tripcode";

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

fn board_param(state: &AppState, request: &PluginRequest) -> Result<String, ApiError> {
    let board = request.param("board").unwrap_or_default();
    if !state.store.has_board(board) {
        return Err(DomainError::UnknownBoard(board.to_string()).into());
    }
    Ok(board.to_string())
}

fn id_param(request: &PluginRequest, name: &str) -> Result<u64, ApiError> {
    let raw = request.param(name).unwrap_or_default();
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {name} id {raw:?}")))
}

/// Resolves `{board}/{thread}` and checks the thread lives on that board.
fn thread_on_board(state: &AppState, request: &PluginRequest) -> Result<(String, u64), ApiError> {
    let board = board_param(state, request)?;
    let thread_id = id_param(request, "thread")?;
    match state.store.thread(thread_id) {
        Some(thread) if thread.board == board => Ok((board, thread_id)),
        _ => Err(DomainError::thread_not_found(thread_id).into()),
    }
}

fn moderator_signature(request: &PluginRequest) -> &str {
    request.field(MODERATOR_FIELD).unwrap_or_default()
}

fn shell(state: &AppState, request: &PluginRequest, title: String, source: &str) -> Result<Response, ApiError> {
    let page = PageShell {
        title,
        prefix: &state.route_prefix,
        boards: state.store.boards(),
        source: state.url(source),
        injection: state.plugins.template_injection(request.method, &request.route),
        stats: Some(state.store.statistics()),
    };
    Ok(Html(page.render()?).into_response())
}

/// Counts a rejected submission before handing the error back.
fn track_rejection(state: &AppState, err: DomainError) -> ApiError {
    if matches!(err, DomainError::Validation(_)) {
        state.metrics.submissions_rejected.inc();
    }
    err.into()
}

async fn after_submit(state: &AppState, request: &PluginRequest, kind: ContentKind, id: u64) {
    if let Err(e) = state.plugins.post_submit(request, kind, id).await {
        state.metrics.post_submit_failures.inc();
        warn!(%kind, id, error = %e, "post-submit action failed");
    }
}

fn submission(request: &PluginRequest) -> RawSubmission {
    request.fields.clone()
}

// ── Pages ───────────────────────────────────────────────────────────────

pub async fn index(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    shell(&state, &request, "threadboard".into(), "/source.json")
}

pub async fn board_page(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let board = board_param(&state, &request)?;
    shell(&state, &request, format!("/{board}/"), &format!("/{board}/source.json"))
}

pub async fn thread_page(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (board, thread_id) = thread_on_board(&state, &request)?;
    shell(
        &state,
        &request,
        format!("/{board}/ #{thread_id}"),
        &format!("/{board}/{thread_id}/source.json"),
    )
}

// ── JSON sources ────────────────────────────────────────────────────────

pub async fn recent_source(state: AppState, _request: PluginRequest) -> Result<Response, ApiError> {
    let posts: Vec<_> = state.store.recent_feed(state.recent_feed_limit).collect();
    Ok(Json(json!({ "posts": posts })).into_response())
}

pub async fn board_source(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let board = board_param(&state, &request)?;
    Ok(Json(state.store.board_feed(&board)?).into_response())
}

pub async fn thread_source(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (_, thread_id) = thread_on_board(&state, &request)?;
    Ok(Json(state.store.thread_detail(thread_id)?).into_response())
}

// ── Submissions ─────────────────────────────────────────────────────────

pub async fn new_thread(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let board = board_param(&state, &request)?;
    let id = state
        .store
        .create_thread(&board, &submission(&request))
        .await
        .map_err(|e| track_rejection(&state, e))?;
    state.metrics.threads_created.inc();
    info!(board, id, "thread created");

    after_submit(&state, &request, ContentKind::Thread, id).await;
    Ok(Redirect::to(&state.url(&format!("/{board}/{id}/"))).into_response())
}

pub async fn reply(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (board, thread_id) = thread_on_board(&state, &request)?;
    let id = state
        .store
        .create_post(thread_id, &submission(&request))
        .await
        .map_err(|e| track_rejection(&state, e))?;
    state.metrics.posts_created.inc();
    info!(board, thread_id, id, "reply created");

    after_submit(&state, &request, ContentKind::Post, id).await;
    Ok(Redirect::to(&state.url(&format!("/{board}/{thread_id}/#{id}"))).into_response())
}

// ── Moderation ──────────────────────────────────────────────────────────

pub async fn pin(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (board, thread_id) = thread_on_board(&state, &request)?;
    state.store.pin(thread_id, moderator_signature(&request)).await?;
    Ok(Redirect::to(&state.url(&format!("/{board}/{thread_id}/?pinned=1"))).into_response())
}

pub async fn delete_thread(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (board, thread_id) = thread_on_board(&state, &request)?;
    state.store.delete_thread(thread_id, moderator_signature(&request)).await?;
    Ok(Redirect::to(&state.url(&format!("/{board}/"))).into_response())
}

pub async fn delete_post(state: AppState, request: PluginRequest) -> Result<Response, ApiError> {
    let (board, thread_id) = thread_on_board(&state, &request)?;
    let post_id = id_param(&request, "post")?;
    state
        .store
        .delete_post(thread_id, post_id, moderator_signature(&request))
        .await?;
    Ok(Redirect::to(&state.url(&format!("/{board}/{thread_id}/"))).into_response())
}

// ── Operations ──────────────────────────────────────────────────────────

pub async fn metrics(state: AppState, _request: PluginRequest) -> Result<Response, ApiError> {
    state.metrics.observe(&state.store);
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, OPENMETRICS)], body).into_response())
}

