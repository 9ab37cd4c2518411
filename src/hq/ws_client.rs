//! Upstream `/buffers` aggregation.
//!
//! When a client of the HQ subscribes to a session owned by a remote, the HQ
//! opens (or reuses) one WebSocket to that remote's `/buffers`, subscribes
//! there, and forwards the binary frames verbatim — the session id inside
//! the frame already disambiguates. The upstream subscription is dropped
//! when the last local subscriber goes away.
//!
//! Connections reconnect with exponential backoff capped at 30 s while any
//! subscription is outstanding.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::ws::protocol::frame_session_id;

use super::registry::{RemoteRecord, RemoteRegistry};

const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-topic fan-out capacity; slow local subscribers drop frames.
const TOPIC_CAPACITY: usize = 64;

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>;

enum UpstreamCmd {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

struct HubInner {
    /// remote id → command channel of its connection task
    connections: HashMap<String, mpsc::UnboundedSender<UpstreamCmd>>,
    /// session id → local subscriber count
    counts: HashMap<String, usize>,
}

/// Fan-out hub for buffer frames arriving from remotes.
#[derive(Clone)]
pub struct UpstreamHub {
    registry: RemoteRegistry,
    topics: Topics,
    inner: Arc<Mutex<HubInner>>,
}

impl UpstreamHub {
    pub fn new(registry: RemoteRegistry) -> Self {
        Self {
            registry,
            topics: Arc::new(Mutex::new(HashMap::new())),
            inner: Arc::new(Mutex::new(HubInner {
                connections: HashMap::new(),
                counts: HashMap::new(),
            })),
        }
    }

    /// Subscribe to a remote-owned session. Returns `None` when no remote
    /// owns the id.
    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Vec<u8>>> {
        let remote = self.registry.remote_for_session(session_id)?;

        let receiver = {
            let mut topics = self.topics.lock().expect("upstream topics poisoned");
            topics
                .entry(session_id.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };

        let mut inner = self.inner.lock().expect("upstream hub poisoned");
        *inner.counts.entry(session_id.to_string()).or_default() += 1;

        let cmd_tx = inner
            .connections
            .entry(remote.id.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(upstream_task(
                    remote.clone(),
                    self.registry.clone(),
                    Arc::clone(&self.topics),
                    rx,
                ));
                tx
            });
        let _ = cmd_tx.send(UpstreamCmd::Subscribe(session_id.to_string()));
        Some(receiver)
    }

    /// Drop one local subscription; unsubscribes upstream on the last one.
    pub fn unsubscribe(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("upstream hub poisoned");
        let remaining = match inner.counts.get_mut(session_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }
        inner.counts.remove(session_id);
        self.topics
            .lock()
            .expect("upstream topics poisoned")
            .remove(session_id);

        if let Some(remote) = self.registry.remote_for_session(session_id) {
            if let Some(cmd_tx) = inner.connections.get(&remote.id) {
                let _ = cmd_tx.send(UpstreamCmd::Unsubscribe(session_id.to_string()));
            }
        }
    }

    /// Tear down the connection to a remote (after unregistration).
    pub fn remove_remote(&self, remote_id: &str) {
        let mut inner = self.inner.lock().expect("upstream hub poisoned");
        if let Some(cmd_tx) = inner.connections.remove(remote_id) {
            let _ = cmd_tx.send(UpstreamCmd::Shutdown);
        }
    }
}

/// Build the remote's `/buffers` URL from its HTTP base URL.
fn buffers_url(remote: &RemoteRecord) -> String {
    let ws_base = if let Some(rest) = remote.url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = remote.url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{}", remote.url)
    };
    format!(
        "{}/buffers?token={}",
        ws_base.trim_end_matches('/'),
        remote.token
    )
}

/// One connection to one remote's `/buffers`, living as long as commands can
/// still arrive.
async fn upstream_task(
    remote: RemoteRecord,
    registry: RemoteRegistry,
    topics: Topics,
    mut cmd_rx: mpsc::UnboundedReceiver<UpstreamCmd>,
) {
    let url = buffers_url(&remote);
    let mut wanted: HashSet<String> = HashSet::new();
    let mut delay = Duration::from_secs(1);

    'reconnect: loop {
        if registry.get(&remote.id).is_none() {
            debug!("upstream {}: remote unregistered, stopping", remote.name);
            return;
        }

        let connect = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(&url),
        )
        .await
        .unwrap_or_else(|_| {
            Err(tokio_tungstenite::tungstenite::Error::Io(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"),
            ))
        });
        let (mut stream, _) = match connect {
            Ok(ok) => {
                delay = Duration::from_secs(1);
                ok
            }
            Err(e) => {
                warn!(
                    "upstream {}: connect failed ({e}), retrying in {}s",
                    remote.name,
                    delay.as_secs()
                );
                // Commands must keep draining while we back off.
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        () = &mut sleep => break,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(UpstreamCmd::Subscribe(id)) => { wanted.insert(id); }
                            Some(UpstreamCmd::Unsubscribe(id)) => { wanted.remove(&id); }
                            Some(UpstreamCmd::Shutdown) | None => return,
                        },
                    }
                }
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                continue 'reconnect;
            }
        };
        info!("upstream {}: connected to {}", remote.name, remote.url);

        for id in &wanted {
            let msg = json!({"type": "subscribe", "sessionId": id}).to_string();
            if stream.send(Message::Text(msg.into())).await.is_err() {
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let msg = match cmd {
                        Some(UpstreamCmd::Subscribe(id)) => {
                            wanted.insert(id.clone());
                            json!({"type": "subscribe", "sessionId": id})
                        }
                        Some(UpstreamCmd::Unsubscribe(id)) => {
                            wanted.remove(&id);
                            json!({"type": "unsubscribe", "sessionId": id})
                        }
                        Some(UpstreamCmd::Shutdown) | None => {
                            let _ = stream.close(None).await;
                            return;
                        }
                    };
                    if stream.send(Message::Text(msg.to_string().into())).await.is_err() {
                        continue 'reconnect;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(frame))) => {
                            let frame: Vec<u8> = frame.into();
                            let Some(session_id) = frame_session_id(&frame) else {
                                debug!("upstream {}: malformed binary frame", remote.name);
                                continue;
                            };
                            let topics = topics.lock().expect("upstream topics poisoned");
                            if let Some(tx) = topics.get(session_id) {
                                let _ = tx.send(frame.clone());
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            // Answer keepalive pings; acks need no handling.
                            if text.contains("\"ping\"") {
                                let pong = json!({"type": "pong"}).to_string();
                                let _ = stream.send(Message::Text(pong.into())).await;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("upstream {}: stream error: {e}", remote.name);
                            continue 'reconnect;
                        }
                        None => {
                            info!("upstream {}: connection closed", remote.name);
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}
