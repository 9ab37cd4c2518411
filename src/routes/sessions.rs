//! REST endpoints for session management.
//!
//! - `GET    /api/sessions`              — list (HQ: local + all remotes)
//! - `POST   /api/sessions`              — create (HQ: forward with `remoteId`)
//! - `GET    /api/sessions/{id}`         — metadata
//! - `DELETE /api/sessions/{id}`         — kill
//! - `PATCH  /api/sessions/{id}`         — rename
//! - `POST   /api/sessions/{id}/input`   — write to stdin
//! - `POST   /api/sessions/{id}/resize`  — change terminal size
//! - `GET    /api/sessions/{id}/text`    — plain-text buffer (`?styles=true` keeps SGR)
//! - `GET    /api/sessions/{id}/buffer`  — binary buffer snapshot
//! - `GET    /api/sessions/{id}/activity`, `GET /api/sessions/activity`
//! - `POST   /api/cleanup-exited`        — drop every exited session
//!
//! On an HQ, any per-session request whose id belongs to a known remote is
//! transparently forwarded (method, path, body — auth replaced with the
//! remote's bearer token) and the response streamed back.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hyper::body::Bytes;
use hyper::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::hq::forwarder::ForwardedResponse;
use crate::sessions::SessionSpec;
use crate::state::AppState;
use crate::term::encode::encode_snapshot;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// HQ only: create the session on this remote instead.
    #[serde(default)]
    pub remote_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TextQuery {
    #[serde(default)]
    pub styles: Option<bool>,
}

/// `GET /api/sessions` — local sessions plus, on an HQ, every reachable
/// remote's sessions tagged with their origin.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let mut sessions = state.session_manager.list_sessions().await;
    if let Some(ref hq) = state.hq {
        for session in &mut sessions {
            session.source = Some("local".to_string());
        }
        sessions.extend(hq.aggregate_sessions().await);
    }
    Json(json!(sessions))
}

/// `POST /api/sessions` — create a session, locally or on a remote.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(ref remote_id) = request.remote_id {
        let Some(ref hq) = state.hq else {
            return Err(ApiError::InvalidArgument(
                "remoteId is only valid on an HQ node".to_string(),
            ));
        };
        let remote = hq
            .registry
            .get(remote_id)
            .ok_or_else(|| ApiError::NotFound("unknown remote".to_string()))?;
        let body = serde_json::to_vec(&json!({
            "command": request.command,
            "workingDir": request.working_dir,
            "name": request.name,
            "cols": request.cols,
            "rows": request.rows,
            "env": request.env,
            "term": request.term,
            "sessionId": request.session_id,
        }))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
        let response = hq
            .forwarder
            .forward(
                &remote,
                Method::POST,
                "/api/sessions",
                Some("application/json"),
                Bytes::from(body),
            )
            .await?;
        if response.status.is_success() {
            // Index the new session so follow-up requests route to the remote.
            if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
                if let Some(sid) = value["sessionId"].as_str() {
                    let mut ids = remote.session_ids.clone();
                    ids.push(sid.to_string());
                    hq.registry.update_sessions(&remote.id, ids);
                }
            }
        }
        return forwarded_to_json(response);
    }

    let id = state
        .session_manager
        .create_session(SessionSpec {
            id: request.session_id,
            name: request.name,
            command: request.command,
            working_dir: request.working_dir,
            env: request.env.unwrap_or_default(),
            term: request.term,
            cols: request.cols,
            rows: request.rows,
        })
        .await?;
    Ok(Json(json!({ "sessionId": id })))
}

/// `GET /api/sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(response) = proxy_if_remote(&state, &id, Method::GET, "", None, Bytes::new()).await?
    {
        return Ok(response);
    }
    let info = state.session_manager.get_session(&id).await?;
    Ok(Json(json!(info)).into_response())
}

/// `DELETE /api/sessions/{id}` — kill the session.
pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(response) =
        proxy_if_remote(&state, &id, Method::DELETE, "", None, Bytes::new()).await?
    {
        return Ok(response);
    }
    state.session_manager.kill_session(&id).await?;
    Ok(Json(json!({ "ok": true, "sessionId": id })).into_response())
}

/// `PATCH /api/sessions/{id}` — rename.
pub async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(&json!({"name": request.name}))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(response) = proxy_if_remote(
        &state,
        &id,
        Method::PATCH,
        "",
        Some("application/json"),
        Bytes::from(body),
    )
    .await?
    {
        return Ok(response);
    }

    state.session_manager.get_session(&id).await?;
    state
        .session_manager
        .control_dir()
        .update(&id, |info| info.name = Some(request.name.clone()))?;
    let _ = state.session_events.send(json!({
        "type": "session.renamed",
        "sessionId": id,
        "name": request.name,
    }));
    Ok(Json(json!({ "ok": true, "sessionId": id })).into_response())
}

/// `POST /api/sessions/{id}/input`.
pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(&json!({"text": request.text}))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(response) = proxy_if_remote(
        &state,
        &id,
        Method::POST,
        "/input",
        Some("application/json"),
        Bytes::from(body),
    )
    .await?
    {
        return Ok(response);
    }
    state
        .session_manager
        .send_input(&id, request.text.as_bytes())
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

/// `POST /api/sessions/{id}/resize`.
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(&json!({"cols": request.cols, "rows": request.rows}))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(response) = proxy_if_remote(
        &state,
        &id,
        Method::POST,
        "/resize",
        Some("application/json"),
        Bytes::from(body),
    )
    .await?
    {
        return Ok(response);
    }
    state
        .session_manager
        .resize(&id, request.cols, request.rows)
        .await?;
    Ok(Json(json!({ "ok": true, "cols": request.cols, "rows": request.rows })).into_response())
}

/// `GET /api/sessions/{id}/text` — the visible grid as plain text.
pub async fn session_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TextQuery>,
) -> Result<Response, ApiError> {
    let suffix = if query.styles == Some(true) {
        "/text?styles=true"
    } else {
        "/text"
    };
    if let Some(response) =
        proxy_if_remote(&state, &id, Method::GET, suffix, None, Bytes::new()).await?
    {
        return Ok(response);
    }
    let engine = state
        .session_manager
        .term_engine(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))?;
    let text = if query.styles == Some(true) {
        engine.text_styled()
    } else {
        engine.text()
    };
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

/// `GET /api/sessions/{id}/buffer` — binary snapshot payload (no WS
/// envelope).
pub async fn session_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(response) =
        proxy_if_remote(&state, &id, Method::GET, "/buffer", None, Bytes::new()).await?
    {
        return Ok(response);
    }
    let engine = state
        .session_manager
        .term_engine(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))?;
    let payload = encode_snapshot(&engine.snapshot());
    Ok(([(CONTENT_TYPE, "application/octet-stream")], payload).into_response())
}

/// `GET /api/sessions/{id}/activity`.
pub async fn session_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(response) =
        proxy_if_remote(&state, &id, Method::GET, "/activity", None, Bytes::new()).await?
    {
        return Ok(response);
    }
    let activity = state.session_manager.activity(&id).await?;
    Ok(Json(json!(activity)).into_response())
}

/// `GET /api/sessions/activity` — activity for every local session.
pub async fn all_activity(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.session_manager.activity_all().await))
}

/// `POST /api/cleanup-exited`.
pub async fn cleanup_exited(State(state): State<AppState>) -> Json<Value> {
    let removed = state.session_manager.cleanup_exited().await;
    Json(json!({ "removed": removed }))
}

/// Forward a per-session request when the id belongs to a registered remote.
/// Returns `Ok(None)` for local sessions (and on non-HQ nodes).
pub async fn proxy_if_remote(
    state: &AppState,
    session_id: &str,
    method: Method,
    path_suffix: &str,
    content_type: Option<&str>,
    body: Bytes,
) -> Result<Option<Response>, ApiError> {
    let Some(ref hq) = state.hq else {
        return Ok(None);
    };
    let Some(remote) = hq.registry.remote_for_session(session_id) else {
        return Ok(None);
    };
    let path = format!("/api/sessions/{session_id}{path_suffix}");
    let forwarded = hq
        .forwarder
        .forward(&remote, method, &path, content_type, body)
        .await?;
    Ok(Some(forwarded_response(forwarded)))
}

/// Convert a buffered forward into an axum response, preserving status and
/// content type.
fn forwarded_response(forwarded: ForwardedResponse) -> Response {
    let mut builder = Response::builder().status(forwarded.status);
    if let Some(ct) = forwarded.content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(forwarded.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn forwarded_to_json(forwarded: ForwardedResponse) -> Result<Json<Value>, ApiError> {
    if !forwarded.status.is_success() {
        let message = serde_json::from_slice::<Value>(&forwarded.body)
            .ok()
            .and_then(|v| v["error"].as_str().map(ToString::to_string))
            .unwrap_or_else(|| format!("remote returned {}", forwarded.status));
        return Err(ApiError::Upstream(message));
    }
    serde_json::from_slice(&forwarded.body)
        .map(Json)
        .map_err(|e| ApiError::Upstream(format!("remote sent bad JSON: {e}")))
}
