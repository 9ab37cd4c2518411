//! HQ remote-registration surface.
//!
//! - `POST   /api/remotes`      — register (or refresh) a remote node
//! - `GET    /api/remotes`      — list registered remotes
//! - `DELETE /api/remotes/{id}` — drop a remote
//!
//! Registration authenticates with Basic credentials (the HQ's configured
//! username/password) because the registering node has no bearer token yet;
//! the usual bearer and local-bypass paths are accepted too, so these
//! routes sit outside the bearer middleware and check for themselves.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::hq::HqState;
use crate::state::AppState;
use crate::util::OptionalPeerAddr;

#[derive(Debug, Deserialize)]
pub struct RegisterRemoteRequest {
    pub name: String,
    pub url: String,
    pub token: String,
}

/// `POST /api/remotes`.
pub async fn register_remote(
    State(state): State<AppState>,
    peer: OptionalPeerAddr,
    headers: HeaderMap,
    Json(request): Json<RegisterRemoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let hq = require_hq(&state)?;
    check_credentials(&state, &headers, peer.0)?;

    if request.name.is_empty() || request.url.is_empty() || request.token.is_empty() {
        return Err(ApiError::InvalidArgument(
            "name, url, and token are required".to_string(),
        ));
    }

    let record = hq
        .registry
        .register(request.name, request.url, request.token);
    info!("Remote '{}' registered from {}", record.name, record.url);
    let _ = state.session_events.send(json!({
        "type": "remote.registered",
        "remoteId": record.id,
        "name": record.name,
    }));
    Ok(Json(json!(record)))
}

/// `GET /api/remotes`.
pub async fn list_remotes(
    State(state): State<AppState>,
    peer: OptionalPeerAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let hq = require_hq(&state)?;
    check_credentials(&state, &headers, peer.0)?;
    Ok(Json(json!(hq.registry.list())))
}

/// `DELETE /api/remotes/{id}`.
pub async fn unregister_remote(
    State(state): State<AppState>,
    peer: OptionalPeerAddr,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let hq = require_hq(&state)?;
    check_credentials(&state, &headers, peer.0)?;

    let record = hq
        .registry
        .unregister(&id)
        .ok_or_else(|| ApiError::NotFound("unknown remote".to_string()))?;
    hq.upstream.remove_remote(&id);
    info!("Remote '{}' unregistered", record.name);
    let _ = state.session_events.send(json!({
        "type": "remote.unregistered",
        "remoteId": id,
        "name": record.name,
    }));
    Ok(Json(json!({ "ok": true })))
}

fn require_hq(state: &AppState) -> Result<&HqState, ApiError> {
    state
        .hq
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("this node is not an HQ".to_string()))
}

/// Basic credentials, bearer token, local bypass, or auth disabled.
fn check_credentials(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<(), ApiError> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    if state.auth.allows(peer, bearer) {
        return Ok(());
    }

    if let Some((username, password)) = basic_credentials(headers) {
        let expected = state.config.hq.as_ref();
        let user_ok = expected
            .and_then(|hq| hq.username.as_deref())
            .is_some_and(|u| crate::auth::constant_time_eq(u.as_bytes(), username.as_bytes()));
        let pass_ok = expected
            .and_then(|hq| hq.password.as_deref())
            .is_some_and(|p| crate::auth::constant_time_eq(p.as_bytes(), password.as_bytes()));
        if user_ok && pass_ok {
            return Ok(());
        }
    }

    Err(ApiError::Unauthorized(
        "missing or invalid credentials".to_string(),
    ))
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Basic {}", BASE64.encode("admin:s3cret"))
                .parse()
                .unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("admin".to_string(), "s3cret".to_string()))
        );

        headers.insert("authorization", "Bearer tok".parse().unwrap());
        assert_eq!(basic_credentials(&headers), None);
    }
}
