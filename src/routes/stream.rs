//! Per-session SSE stream of the recording.
//!
//! `GET /api/sessions/{id}/stream` replays the recording from the start (or
//! from `Last-Event-ID`) and then live-tails the file until the terminal
//! exit record. Event ids are line numbers (the header is id 0), so a
//! reconnecting client resumes where it left off. Keepalive comments go out
//! every 15 s.
//!
//! On an HQ, streams for remote-owned sessions are proxied without a
//! deadline; they end when the client disconnects.

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use hyper::body::Bytes;
use hyper::Method;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::ApiError;
use crate::state::AppState;

/// Poll interval while tailing the recording for new lines.
const TAIL_INTERVAL: Duration = Duration::from_millis(250);

/// `GET /api/sessions/{id}/stream`.
pub async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // Streaming forwards carry no deadline; the body is handed through.
    if let Some(ref hq) = state.hq {
        if let Some(remote) = hq.registry.remote_for_session(&id) {
            let upstream = hq
                .forwarder
                .forward_raw(
                    &remote,
                    Method::GET,
                    &format!("/api/sessions/{id}/stream"),
                    None,
                    Bytes::new(),
                )
                .await?;
            let mut builder = Response::builder().status(upstream.status());
            if let Some(ct) = upstream.headers().get(CONTENT_TYPE) {
                builder = builder.header(CONTENT_TYPE, ct);
            }
            return builder
                .body(Body::new(upstream.into_body()))
                .map_err(|e| ApiError::Internal(e.to_string()));
        }
    }

    state.session_manager.get_session(&id).await?;
    let path = state.session_manager.control_dir().paths(&id).stream_out;

    let resume_after: Option<u64> = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let stream = tail_recording(path, resume_after).await?;
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response())
}

struct TailState {
    reader: BufReader<File>,
    /// 0-based line number of the next line to read (header is 0).
    next_line: u64,
    /// Emit only lines with id > this.
    resume_after: i64,
    /// Partial trailing line seen at EOF, waiting for its newline.
    partial: String,
    done: bool,
}

async fn tail_recording(
    path: PathBuf,
    resume_after: Option<u64>,
) -> Result<impl Stream<Item = Result<Event, Infallible>>, ApiError> {
    let file = File::open(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("open recording: {e}")))?;

    #[allow(clippy::cast_possible_wrap)]
    let state = TailState {
        reader: BufReader::new(file),
        next_line: 0,
        resume_after: resume_after.map_or(-1, |v| v as i64),
        partial: String::new(),
        done: false,
    };

    Ok(futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let mut chunk = String::new();
            match st.reader.read_line(&mut chunk).await {
                Ok(0) => {
                    // EOF — wait for the writer to append more.
                    tokio::time::sleep(TAIL_INTERVAL).await;
                }
                Ok(_) => {
                    if !chunk.ends_with('\n') {
                        // Mid-write line; keep it and pick up the rest later.
                        st.partial.push_str(&chunk);
                        tokio::time::sleep(TAIL_INTERVAL).await;
                        continue;
                    }
                    let line = format!("{}{}", std::mem::take(&mut st.partial), chunk);
                    let line = line.trim_end_matches('\n');
                    let line_id = st.next_line;
                    st.next_line += 1;
                    if line.is_empty() {
                        continue;
                    }
                    #[allow(clippy::cast_possible_wrap)]
                    if (line_id as i64) <= st.resume_after {
                        continue;
                    }
                    if line.starts_with("[\"exit\"") {
                        st.done = true;
                    }
                    let event = Event::default().id(line_id.to_string()).data(line);
                    return Some((Ok(event), st));
                }
                Err(e) => {
                    tracing::warn!("recording tail failed: {e}");
                    return None;
                }
            }
        }
    }))
}
