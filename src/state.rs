//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::auth::AuthPolicy;
use crate::config::Config;
use crate::hq::HqState;
use crate::sessions::SessionManager;

/// Shared server state. Cloneable; every field is a handle.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration resolved at startup.
    pub config: Arc<Config>,
    /// Monotonic instant the server started (uptime reporting).
    pub start_time: Instant,
    /// The session registry and lifecycle authority.
    pub session_manager: SessionManager,
    /// Broadcast of lifecycle events (session created/exited/destroyed,
    /// remote registered/lost) feeding the events SSE stream.
    pub session_events: broadcast::Sender<Value>,
    /// Request authentication policy.
    pub auth: AuthPolicy,
    /// Federation state; `Some` only when running as HQ.
    pub hq: Option<HqState>,
}

impl AppState {
    /// Whether this node is an HQ.
    pub fn is_hq(&self) -> bool {
        self.hq.is_some()
    }
}
