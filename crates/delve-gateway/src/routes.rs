use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::Json;
use futures::Stream;
use tracing::{error, info};

use delve_core::config::ApiKeyRole;
use delve_core::types::RunId;
use delve_engine::RunSnapshot;

use crate::auth::Caller;
use crate::host::RunRequest;
use crate::protocol::StreamRunBody;
use crate::sse;
use crate::state::AppState;

// GET /api/health (no auth)
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/runs/:id/stream (Operator+)
pub async fn stream_run(
    caller: Caller,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StreamRunBody>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    caller.require(ApiKeyRole::Operator)?;
    if id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    info!(run_id = %id, caller = %caller.name, "Run stream requested");

    let mut request = RunRequest::new(RunId::from_string(&id), body.payload());
    request.workflow = body.workflow;
    request.thread_item_id = body.thread_item_id;

    let stream = state.host.execute(request);
    Ok(sse::sse_response(stream, state.config.heartbeat_secs))
}

// POST /api/runs/:id/cancel (Operator+)
pub async fn cancel_run(
    caller: Caller,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    caller.require(ApiKeyRole::Operator)?;
    if !state.host.cancel(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(serde_json::json!({ "run_id": id, "cancelled": true })))
}

// GET /api/runs/:id (Viewer+)
pub async fn get_run(
    caller: Caller,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    caller.require(ApiKeyRole::Viewer)?;

    match RunSnapshot::load_from(state.store.as_ref(), &id).await {
        Ok(Some(snapshot)) => {
            let mut summary = snapshot.summary();
            summary["live"] = serde_json::json!(state.host.is_live(&id));
            Ok(Json(summary))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(run_id = %id, error = %e, "Failed to load run");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// DELETE /api/runs/:id (Admin)
pub async fn delete_run(
    caller: Caller,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    caller.require(ApiKeyRole::Admin)?;
    if state.host.is_live(&id) {
        return Err(StatusCode::CONFLICT);
    }

    match state.store.delete(&id).await {
        Ok(true) => {
            info!(run_id = %id, "Run deleted");
            Ok(Json(serde_json::json!({ "run_id": id, "deleted": true })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(run_id = %id, error = %e, "Failed to delete run");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /api/runs (Viewer+)
pub async fn list_runs(
    caller: Caller,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    caller.require(ApiKeyRole::Viewer)?;
    match state.store.list().await {
        Ok(ids) => Ok(Json(serde_json::json!({ "runs": ids }))),
        Err(e) => {
            error!(error = %e, "Failed to list runs");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
