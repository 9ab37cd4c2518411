//! Server information endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/info` — server identity and role.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let role = if state.is_hq() {
        "hq"
    } else if state
        .config
        .hq
        .as_ref()
        .is_some_and(|hq| hq.url.is_some())
    {
        "remote"
    } else {
        "standalone"
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "role": role,
        "name": state.config.hq.as_ref().and_then(|hq| hq.name.clone()),
        "controlDir": state.config.control_dir(),
        "port": state.config.server.port,
    }))
}
