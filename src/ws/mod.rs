//! WebSocket buffer hub.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /buffers?token=<token>` — the token is
//!    validated before the upgrade completes (browsers cannot set headers
//!    on WebSocket upgrades).
//! 2. The server sends `{"type":"connected","version":1}`.
//! 3. The client subscribes with `{"type":"subscribe","sessionId":…}` and
//!    receives a binary frame per buffer update, coalesced to at most one
//!    frame per 16 ms per subscription.
//!
//! ## Keepalive and robustness
//!
//! The server pings every 10 s and disconnects a client that has not ponged
//! for 30 s. Malformed or unexpected frames are logged and ignored — they
//! never terminate the connection. A subscriber whose outbound queue fills
//! (64 frames) is disconnected with close code 1008.
//!
//! On an HQ, subscriptions to remote-owned ids are forwarded upstream; the
//! remote's binary frames pass through verbatim.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::state::AppState;
use crate::term::encode::encode_snapshot;
use crate::term::TerminalEngine;
use crate::util::OptionalPeerAddr;
use protocol::{encode_frame, ClientMessage, ServerMessage, BUFFER_MAGIC};

/// Version reported in the `connected` frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Outbound queue bound per connection; overflow disconnects (1008).
const OUTBOUND_QUEUE: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum spacing between snapshots per subscription.
const SNAPSHOT_COALESCE: Duration = Duration::from_millis(16);

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /buffers?token=<token>` — WebSocket upgrade handler.
pub async fn buffers_upgrade(
    State(state): State<AppState>,
    peer: OptionalPeerAddr,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.auth.allows(peer.0, query.token.as_deref()) {
        return ApiError::Unauthorized("missing or invalid token".to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Subscription {
    Local(tokio::task::JoinHandle<()>),
    Remote(tokio::task::JoinHandle<()>),
}

impl Subscription {
    fn abort(&self) {
        match self {
            Subscription::Local(h) | Subscription::Remote(h) => h.abort(),
        }
    }

    fn is_remote(&self) -> bool {
        matches!(self, Subscription::Remote(_))
    }
}

#[allow(clippy::too_many_lines)]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();

    // Sender task: funnel outbound messages; a backpressure cancel sends the
    // policy-violation close code.
    let send_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = send_cancel.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1008,
                            reason: "subscriber too slow".into(),
                        })))
                        .await;
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let _ = tx
        .send(text_message(&ServerMessage::Connected {
            version: PROTOCOL_VERSION,
        }))
        .await;

    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    info!("buffer client missed pongs for 30s, disconnecting");
                    break;
                }
                if tx.try_send(text_message(&ServerMessage::Ping)).is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { session_id }) => {
                                subscribe(
                                    &state,
                                    &tx,
                                    &cancel,
                                    &mut subscriptions,
                                    session_id,
                                )
                                .await;
                            }
                            Ok(ClientMessage::Unsubscribe { session_id }) => {
                                if let Some(sub) = subscriptions.remove(&session_id) {
                                    if sub.is_remote() {
                                        if let Some(ref hq) = state.hq {
                                            hq.upstream.unsubscribe(&session_id);
                                        }
                                    }
                                    sub.abort();
                                }
                            }
                            Ok(ClientMessage::Ping) => {
                                let _ = tx.try_send(text_message(&ServerMessage::Pong));
                            }
                            Ok(ClientMessage::Pong) => {
                                last_pong = Instant::now();
                            }
                            Err(e) => {
                                // Never fatal: log and move on.
                                debug!("ignoring malformed control frame: {e}");
                            }
                        }
                    }
                    Message::Binary(bytes) => {
                        if bytes.first() != Some(&BUFFER_MAGIC) {
                            debug!("discarding client frame with bad magic");
                        } else {
                            debug!("ignoring unexpected client binary frame");
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = tx.try_send(Message::Pong(payload));
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                    }
                    Message::Close(_) => break,
                }
            }
        }
    }

    cancel.cancel();
    for (session_id, sub) in subscriptions {
        if sub.is_remote() {
            if let Some(ref hq) = state.hq {
                hq.upstream.unsubscribe(&session_id);
            }
        }
        sub.abort();
    }
    let _ = send_task.await;
}

async fn subscribe(
    state: &AppState,
    tx: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    subscriptions: &mut HashMap<String, Subscription>,
    session_id: String,
) {
    if subscriptions.contains_key(&session_id) {
        let _ = tx
            .try_send(text_message(&ServerMessage::Subscribed {
                session_id: session_id.clone(),
            }));
        return;
    }

    let subscription = if let Some(engine) = state.session_manager.term_engine(&session_id).await {
        Some(Subscription::Local(tokio::spawn(local_subscriber(
            session_id.clone(),
            engine,
            tx.clone(),
            cancel.clone(),
        ))))
    } else if let Some(receiver) = state
        .hq
        .as_ref()
        .and_then(|hq| hq.upstream.subscribe(&session_id))
    {
        Some(Subscription::Remote(tokio::spawn(remote_subscriber(
            receiver,
            tx.clone(),
            cancel.clone(),
        ))))
    } else {
        None
    };

    match subscription {
        Some(sub) => {
            subscriptions.insert(session_id.clone(), sub);
            let _ = tx
                .try_send(text_message(&ServerMessage::Subscribed { session_id }));
        }
        None => {
            debug!("subscribe to unknown session {session_id}");
            let _ = tx.try_send(Message::Text(
                serde_json::json!({
                    "type": "error",
                    "message": "unknown session",
                    "sessionId": session_id,
                })
                .to_string()
                .into(),
            ));
        }
    }
}

/// Push snapshots of a local session, at most one per coalescing interval.
async fn local_subscriber(
    session_id: String,
    engine: Arc<TerminalEngine>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let notify = engine.notifier();
    let mut last_generation = u64::MAX; // force an initial frame

    loop {
        let generation = engine.generation();
        if generation != last_generation {
            last_generation = generation;
            let payload = encode_snapshot(&engine.snapshot());
            let frame = encode_frame(&session_id, &payload);
            match tx.try_send(Message::Binary(frame.into())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("buffer subscriber for {session_id} overflowed, disconnecting");
                    cancel.cancel();
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            // The timeout guards against a wakeup lost between the
            // generation read and re-registering with the notifier.
            _ = tokio::time::timeout(Duration::from_millis(250), notify.notified()) => {}
        }
        tokio::time::sleep(SNAPSHOT_COALESCE).await;
    }
}

/// Pass through binary frames arriving from an upstream remote.
async fn remote_subscriber(
    mut receiver: tokio::sync::broadcast::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            frame = receiver.recv() => match frame {
                Ok(frame) => match tx.try_send(Message::Binary(frame.into())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("remote buffer subscriber overflowed, disconnecting");
                        cancel.cancel();
                        return;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("remote buffer subscriber lagged by {n} frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn text_message(message: &ServerMessage) -> Message {
    Message::Text(
        serde_json::to_string(message)
            .unwrap_or_default()
            .into(),
    )
}
