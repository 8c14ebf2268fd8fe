//! HTTP surface: the trigger route plus watch management RPCs.
//!
//! The trigger route always answers HTTP 200 and carries failure detail in
//! the body, matching what scheduled callers expect. Management RPCs use
//! conventional status codes.

use crate::db::Db;
use crate::error::IngestError;
use crate::pipeline;
use crate::twitter_api::SearchProvider;
use crate::worker::ContinuationJob;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use watch_ingest_types::*;

pub struct AppState {
    pub db: Arc<Db>,
    pub provider: Arc<dyn SearchProvider>,
    pub jobs: UnboundedSender<ContinuationJob>,
    pub started: Instant,
}

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "success": true }))
}

/// POST /rpc/watches/run
///
/// Body: `{"name": "<watch>", "user": "<caller>"}`. Runs the pipeline for
/// one watch.
pub async fn watches_run(
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Json<TriggerResponse> {
    let Some(Json(body)) = body else {
        return Json(TriggerResponse::err("The request format is empty."));
    };
    let (Some(name), Some(user)) = (
        body.get("name").and_then(|v| v.as_str()),
        body.get("user").and_then(|v| v.as_str()),
    ) else {
        return Json(TriggerResponse::err("The request format is wrong."));
    };

    log::info!("[WATCH_INGEST] Trigger received for watch {name} from {user}");
    match pipeline::run_watch(&state.db, state.provider.as_ref(), &state.jobs, name).await {
        Ok(stats) => {
            log::info!(
                "[WATCH_INGEST] Watch {name}: {} new, {} maintained",
                stats.tweets_new,
                stats.tweets_maintained
            );
            Json(TriggerResponse::ok(
                stats.tweets_new,
                stats.tweets_maintained,
                stats.ratelimit,
            ))
        }
        Err(e) => {
            log::error!("[WATCH_INGEST] Watch {name} failed: {e}");
            Json(TriggerResponse::err(e.to_string()))
        }
    }
}

/// POST /rpc/watches/add
pub async fn watches_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddWatchRequest>,
) -> (StatusCode, Json<RpcResponse<WatchConfig>>) {
    if req.name.trim().is_empty() || req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::err("name and query are required")),
        );
    }

    match state.db.add_watch(&req) {
        Ok(watch) => {
            log::info!("[WATCH_INGEST] Added watch {}", watch.name);
            (StatusCode::OK, Json(RpcResponse::ok(watch)))
        }
        Err(e) if e.to_string().contains("UNIQUE") => (
            StatusCode::CONFLICT,
            Json(RpcResponse::err(format!(
                "A watch named {} already exists.",
                req.name
            ))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(e.to_string())),
        ),
    }
}

/// GET /rpc/watches/list
pub async fn watches_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<WatchConfig>>>) {
    match state.db.list_watches() {
        Ok(watches) => (StatusCode::OK, Json(RpcResponse::ok(watches))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(e.to_string())),
        ),
    }
}

/// POST /rpc/watches/stop
///
/// Raises the kill switch; the worker honors it before its next fetch.
pub async fn watches_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopWatchRequest>,
) -> (StatusCode, Json<RpcResponse<Value>>) {
    match state.db.set_kill_switch(&req.name, true) {
        Ok(true) => {
            log::info!("[WATCH_INGEST] Stop requested for watch {}", req.name);
            (
                StatusCode::OK,
                Json(RpcResponse::ok(serde_json::json!({ "stopping": req.name }))),
            )
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(
                IngestError::UnknownWatch(req.name).to_string(),
            )),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(e.to_string())),
        ),
    }
}

/// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    match state.db.get_service_stats() {
        Ok((watches, active_watches, total_records, total_authors)) => (
            StatusCode::OK,
            Json(RpcResponse::ok(ServiceStatus {
                running: true,
                uptime_secs: state.started.elapsed().as_secs(),
                watches,
                active_watches,
                total_records,
                total_authors,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(e.to_string())),
        ),
    }
}
