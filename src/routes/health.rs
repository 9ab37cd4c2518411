//! Unauthenticated health-check endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and session count. No authentication
/// required, suitable for load-balancer checks and HQ health probes.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.session_manager.session_count().await;

    let mut body = json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
    });
    if let Some(ref hq) = state.hq {
        body["hq"] = json!({
            "remotes": hq.registry.list().len(),
        });
    }
    Json(body)
}
