//! Server-Sent Events endpoint for lifecycle events.
//!
//! `GET /api/events` — push stream of session and remote lifecycle events
//! (`session.created`, `session.exited`, `session.destroyed`,
//! `session.renamed`, `remote.registered`, …). Subscribes to the same
//! broadcast channel the rest of the server publishes on.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;

use crate::state::AppState;

/// `GET /api/events` — SSE event stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.session_events.subscribe();

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(value) => {
                let event_type = value["type"].as_str().unwrap_or("message").to_string();
                let data = serde_json::to_string(&value).unwrap_or_default();
                let event = Event::default().event(event_type).data(data);
                Some((Ok::<_, Infallible>(event), rx))
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                // Tell the client it missed events rather than silently
                // dropping them.
                let event = Event::default()
                    .event("error")
                    .data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                Some((Ok(event), rx))
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15)))
}
