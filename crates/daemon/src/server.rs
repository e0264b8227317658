//! Operator control plane: JSON API plus the Prometheus text endpoint.
//!
//! A thin adapter over the store, scanner, pool, cleaner, and config
//! handles; nothing here calls back into the handlers.

use crate::cleaner::{CleanError, Cleaner};
use crate::metrics::SharedMetrics;
use crate::scan::Scanner;
use crate::store::{TaskStatus, TaskStore};
use crate::worker::WorkerPool;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use stm_config::SharedConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors that can occur while running the control-plane server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Read-only handles the handlers operate on.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub store: TaskStore,
    pub scanner: Scanner,
    pub pool: Arc<WorkerPool>,
    pub cleaner: Cleaner,
    pub metrics: SharedMetrics,
}

/// Creates the axum router with the full operator API.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/tasks", get(get_tasks))
        .route("/api/tasks/retry-failed", post(retry_failed_tasks))
        .route("/api/tasks/retry-processing", post(retry_processing_tasks))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}", delete(delete_task))
        .route("/api/scan", post(trigger_scan))
        .route("/api/worker/status", get(worker_status))
        .route("/api/worker/force-start", post(force_start))
        .route("/api/worker/force-stop", post(force_stop))
        .route("/api/worker/set-max", post(set_max_workers))
        .route(
            "/api/directories",
            get(get_directories)
                .post(add_directory)
                .delete(remove_directory),
        )
        .route("/api/directories/browse", get(browse_directory))
        .route("/api/trash", get(get_trash))
        .route("/api/trash/{filename}", delete(delete_trash_entry))
        .route("/api/health", get(health))
        .route("/metrics", get(export_metrics))
        .with_state(state)
}

/// Bind and serve until the token fires.
pub async fn run_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

async fn get_stats(State(state): State<AppState>) -> Response {
    let stats = match state.store.stats().await {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };
    state.metrics.update_task_stats(&stats);

    Json(json!({
        "pending": stats.pending,
        "processing": stats.processing,
        "completed": stats.completed,
        "failed": stats.failed,
        "irrecoverable": stats.irrecoverable,
        "saved_gb": stats.total_saved as f64 / 1024.0 / 1024.0 / 1024.0,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    status: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

async fn get_tasks(State(state): State<AppState>, Query(query): Query<TasksQuery>) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let offset = (page - 1) * limit;

    let result = match query.status.as_deref() {
        Some("scan_error") => state.store.get_scan_error_tasks(limit, offset).await,
        Some("") | None => state.store.get_all(None, limit, offset).await,
        Some(raw) => match TaskStatus::from_str(raw) {
            Ok(status) => state.store.get_all(Some(status), limit, offset).await,
            Err(e) => return bad_request(e),
        },
    };

    match result {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retry_task(State(state): State<AppState>, UrlPath(id): UrlPath<i64>) -> Response {
    match state
        .store
        .update_status(id, TaskStatus::Pending, "manual retry")
        .await
    {
        Ok(()) => Json(json!({ "message": "task reset to pending" })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retry_failed_tasks(State(state): State<AppState>) -> Response {
    match state.store.reset_failed_to_pending().await {
        Ok(count) => Json(json!({
            "message": "failed tasks reset to pending",
            "count": count,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn retry_processing_tasks(State(state): State<AppState>) -> Response {
    match state.store.reset_processing_to_pending().await {
        Ok(count) => Json(json!({
            "message": "processing tasks reset to pending",
            "count": count,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn delete_task(State(state): State<AppState>, UrlPath(id): UrlPath<i64>) -> Response {
    match state.store.delete(id).await {
        Ok(()) => Json(json!({ "message": "task deleted" })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn trigger_scan(State(state): State<AppState>) -> Response {
    info!("manual scan requested");
    let scanner = state.scanner.clone();
    // The scan outlives this request; it runs on its own token
    tokio::spawn(async move {
        if let Err(e) = scanner.scan(&CancellationToken::new()).await {
            warn!(error = %e, "manual scan failed");
        }
    });
    Json(json!({ "message": "scan started" })).into_response()
}

async fn worker_status(State(state): State<AppState>) -> Response {
    let status = state.pool.status().await;
    let mode = if status.force_run {
        "force-run"
    } else if status.in_work_window {
        "working-hours"
    } else {
        "idle"
    };

    Json(json!({
        "in_work_window": status.in_work_window,
        "force_run": status.force_run,
        "worker_count": status.worker_count,
        "max_workers": status.max_workers,
        "active_tasks": status.active_tasks,
        "queued_tasks": status.queued_tasks,
        "active": status.force_run || status.in_work_window,
        "mode": mode,
    }))
    .into_response()
}

async fn force_start(State(state): State<AppState>) -> Response {
    state.pool.set_force_run(true).await;
    Json(json!({ "message": "force-run enabled" })).into_response()
}

async fn force_stop(State(state): State<AppState>) -> Response {
    state.pool.set_force_run(false).await;
    Json(json!({ "message": "force-run disabled" })).into_response()
}

#[derive(Debug, Deserialize)]
struct SetMaxWorkersRequest {
    max_workers: i64,
}

async fn set_max_workers(
    State(state): State<AppState>,
    Json(request): Json<SetMaxWorkersRequest>,
) -> Response {
    if !(1..=10).contains(&request.max_workers) {
        return bad_request("max_workers must be between 1 and 10");
    }
    state.pool.set_max_workers(request.max_workers as usize).await;
    Json(json!({
        "message": "worker ceiling updated",
        "max_workers": request.max_workers,
    }))
    .into_response()
}

async fn get_directories(State(state): State<AppState>) -> Response {
    Json(json!({ "pairs": state.config.pairs() })).into_response()
}

#[derive(Debug, Deserialize)]
struct AddDirectoryRequest {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

async fn add_directory(
    State(state): State<AppState>,
    Json(request): Json<AddDirectoryRequest>,
) -> Response {
    if let Err(e) = state.config.add_pair(&request.input_dir, &request.output_dir) {
        return bad_request(e.to_string());
    }

    let warning = persist_config(&state.config, "directory added");

    // New pairs are picked up right away instead of on the next interval
    let scanner = state.scanner.clone();
    tokio::spawn(async move {
        if let Err(e) = scanner.scan(&CancellationToken::new()).await {
            warn!(error = %e, "post-add scan failed");
        }
    });

    let mut body = json!({
        "message": "directory pair added",
        "input_dir": request.input_dir,
        "output_dir": request.output_dir,
        "pairs": state.config.pairs(),
    });
    if let Some(warning) = warning {
        body["warning"] = json!(warning);
    }
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
struct RemoveDirectoryRequest {
    input_dir: PathBuf,
}

async fn remove_directory(
    State(state): State<AppState>,
    Json(request): Json<RemoveDirectoryRequest>,
) -> Response {
    if let Err(e) = state.config.remove_pair(&request.input_dir) {
        return bad_request(e.to_string());
    }

    let warning = persist_config(&state.config, "directory removed");

    let mut body = json!({
        "message": "directory pair removed",
        "pairs": state.config.pairs(),
    });
    if let Some(warning) = warning {
        body["warning"] = json!(warning);
    }
    Json(body).into_response()
}

/// Persist a config mutation, returning a warning string when the change
/// is live but not durable.
fn persist_config(config: &SharedConfig, action: &str) -> Option<String> {
    match config.save() {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "config save failed");
            Some(format!(
                "{action}, but the configuration could not be saved and may revert on restart: {e}"
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct BrowseQuery {
    path: Option<PathBuf>,
}

async fn browse_directory(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Response {
    let path = query
        .path
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| default_browse_path(&state.config));

    if !path.is_absolute() {
        return bad_request("path must be absolute");
    }
    if !path.is_dir() {
        return bad_request(format!("not a browsable directory: {}", path.display()));
    }

    let entries = match std::fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) => return internal_error(e),
    };

    let mut directories = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        // Symlinks are not followed into
        match entry.file_type() {
            Ok(ft) if ft.is_dir() && !ft.is_symlink() => {}
            _ => continue,
        }
        directories.push(json!({
            "name": name,
            "path": entry.path(),
            "is_dir": true,
        }));
    }
    directories.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Json(json!({
        "current_path": path,
        "parent_path": path.parent().unwrap_or(&path),
        "directories": directories,
    }))
    .into_response()
}

fn default_browse_path(config: &SharedConfig) -> PathBuf {
    for pair in config.pairs() {
        if pair.input.is_dir() {
            return pair.input;
        }
    }
    for candidate in ["/mnt", "/input", "/media", "/"] {
        let path = Path::new(candidate);
        if path.is_dir() {
            return path.to_path_buf();
        }
    }
    PathBuf::from("/")
}

async fn get_trash(State(state): State<AppState>) -> Response {
    match state.cleaner.trash_files() {
        Ok(files) => {
            let total_size: u64 = files.iter().map(|f| f.size).sum();
            Json(json!({ "files": files, "total_size": total_size })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn delete_trash_entry(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Response {
    match state.cleaner.delete_trash_file(&filename) {
        Ok(()) => Json(json!({ "message": "trash entry deleted" })).into_response(),
        Err(e @ CleanError::InvalidName(_)) => bad_request(e.to_string()),
        Err(e @ CleanError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let store_ok = state.store.stats().await.is_ok();
    let status = state.pool.status().await;
    let healthy = store_ok;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "database": store_ok,
            "worker_count": status.worker_count,
            "force_run": status.force_run,
            "in_work_window": status.in_work_window,
        })),
    )
        .into_response()
}

async fn export_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
