//! HQ federation: remote-node registration, session aggregation, request
//! forwarding, and buffer-stream aggregation.
//!
//! An HQ node holds a [`RemoteRegistry`] of nodes that registered with it,
//! forwards per-session requests to whichever remote owns the session, and
//! fans `GET /api/sessions` out to every remote in parallel. A remote node
//! runs the [`client`] registration loop instead.

pub mod client;
pub mod forwarder;
pub mod registry;
pub mod ws_client;

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::control::SessionInfo;

pub use forwarder::Forwarder;
pub use registry::{HealthTransition, RemoteRecord, RemoteRegistry};
pub use ws_client::UpstreamHub;

/// Interval between health probes of each registered remote.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Everything an HQ node needs beyond the local session substrate.
#[derive(Clone)]
pub struct HqState {
    pub registry: RemoteRegistry,
    pub forwarder: Forwarder,
    pub upstream: UpstreamHub,
}

impl Default for HqState {
    fn default() -> Self {
        Self::new()
    }
}

impl HqState {
    pub fn new() -> Self {
        let registry = RemoteRegistry::new();
        Self {
            forwarder: Forwarder::new(),
            upstream: UpstreamHub::new(registry.clone()),
            registry,
        }
    }

    /// Fan out to every remote in parallel and collect their sessions,
    /// tagged with their origin. Unreachable remotes are logged and
    /// contribute nothing; each remote's session cache is refreshed from its
    /// response.
    pub async fn aggregate_sessions(&self) -> Vec<SessionInfo> {
        let remotes = self.registry.list();
        let fetches = remotes.into_iter().map(|remote| {
            let forwarder = self.forwarder.clone();
            async move {
                let result = forwarder.fetch_sessions(&remote).await;
                (remote, result)
            }
        });

        let mut out = Vec::new();
        for (remote, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(mut sessions) => {
                    let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
                    self.registry.update_sessions(&remote.id, ids);
                    for session in &mut sessions {
                        session.source = Some("remote".to_string());
                        session.remote_id = Some(remote.id.clone());
                        session.remote_name = Some(remote.name.clone());
                        session.remote_url = Some(remote.url.clone());
                    }
                    out.extend(sessions);
                }
                Err(e) => warn!("session fan-out to {} failed: {e}", remote.name),
            }
        }
        out
    }

    /// Background task probing every remote's health, degrading and finally
    /// unregistering ones that stop answering.
    pub fn spawn_health_checker(
        &self,
        events: broadcast::Sender<serde_json::Value>,
    ) -> tokio::task::JoinHandle<()> {
        let hq = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                for remote in hq.registry.list() {
                    let healthy = hq.forwarder.health_check(&remote).await;
                    match hq.registry.record_health(&remote.id, healthy) {
                        HealthTransition::Unchanged => {}
                        HealthTransition::Degraded => {
                            warn!("remote {} is degraded", remote.name);
                            let _ = events.send(json!({
                                "type": "remote.degraded",
                                "remoteId": remote.id,
                                "name": remote.name,
                            }));
                        }
                        HealthTransition::Unregistered => {
                            info!("remote {} unregistered after repeated failures", remote.name);
                            hq.upstream.remove_remote(&remote.id);
                            let _ = events.send(json!({
                                "type": "remote.unregistered",
                                "remoteId": remote.id,
                                "name": remote.name,
                            }));
                        }
                    }
                }
            }
        })
    }
}
