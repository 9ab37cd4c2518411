//! Registry of remote nodes known to an HQ.
//!
//! Besides the records themselves, the registry maintains a session-id →
//! remote-id index rebuilt from each fan-out response, so "which remote owns
//! this id?" answers in O(1). Health bookkeeping transitions a remote to
//! degraded after consecutive check failures and drops it entirely after a
//! few more.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use uuid::Uuid;

use crate::util::now_iso8601;

/// Consecutive health-check failures before a remote is marked degraded.
pub const DEGRADED_AFTER: u32 = 3;
/// Consecutive failures before a remote is unregistered outright.
pub const UNREGISTER_AFTER: u32 = 6;

/// A registered remote node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    /// Unique across the HQ; re-registration under the same name replaces
    /// the old record.
    pub name: String,
    pub url: String,
    /// Bearer token the HQ presents on every request to this remote.
    #[serde(skip_serializing)]
    pub token: String,
    pub registered_at: String,
    /// Last known session ids on this remote.
    pub session_ids: Vec<String>,
    pub degraded: bool,
    #[serde(skip_serializing)]
    pub consecutive_failures: u32,
}

/// Outcome of recording a health-check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Degraded,
    Unregistered,
}

struct RegistryInner {
    by_id: HashMap<String, RemoteRecord>,
    by_name: HashMap<String, String>,
    session_index: HashMap<String, String>,
}

/// Thread-safe registry shared by the HTTP surface, the health checker, and
/// the WS aggregator.
#[derive(Clone)]
pub struct RemoteRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                session_index: HashMap::new(),
            })),
        }
    }

    /// Register (or re-register) a remote. A name collision replaces the old
    /// record — a restarted remote refreshes its registration this way.
    pub fn register(&self, name: String, url: String, token: String) -> RemoteRecord {
        let record = RemoteRecord {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            url,
            token,
            registered_at: now_iso8601(),
            session_ids: Vec::new(),
            degraded: false,
            consecutive_failures: 0,
        };

        let mut inner = self.inner.write().expect("registry poisoned");
        if let Some(old_id) = inner.by_name.remove(&name) {
            inner.by_id.remove(&old_id);
            inner.session_index.retain(|_, rid| rid != &old_id);
        }
        inner.by_name.insert(name, record.id.clone());
        inner.by_id.insert(record.id.clone(), record.clone());
        record
    }

    /// Drop a remote and its cached sessions.
    pub fn unregister(&self, id: &str) -> Option<RemoteRecord> {
        let mut inner = self.inner.write().expect("registry poisoned");
        let record = inner.by_id.remove(id)?;
        inner.by_name.remove(&record.name);
        inner.session_index.retain(|_, rid| rid != id);
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<RemoteRecord> {
        self.inner
            .read()
            .expect("registry poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<RemoteRecord> {
        let mut records: Vec<RemoteRecord> = self
            .inner
            .read()
            .expect("registry poisoned")
            .by_id
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// The remote that owns `session_id`, if any.
    pub fn remote_for_session(&self, session_id: &str) -> Option<RemoteRecord> {
        let inner = self.inner.read().expect("registry poisoned");
        let remote_id = inner.session_index.get(session_id)?;
        inner.by_id.get(remote_id).cloned()
    }

    /// Replace a remote's cached session ids after a fan-out response.
    pub fn update_sessions(&self, remote_id: &str, session_ids: Vec<String>) {
        let mut inner = self.inner.write().expect("registry poisoned");
        if !inner.by_id.contains_key(remote_id) {
            return;
        }
        inner.session_index.retain(|_, rid| rid != remote_id);
        for sid in &session_ids {
            inner
                .session_index
                .insert(sid.clone(), remote_id.to_string());
        }
        if let Some(record) = inner.by_id.get_mut(remote_id) {
            record.session_ids = session_ids;
        }
    }

    /// Record a health-check result; on `Unregistered` the record is removed.
    pub fn record_health(&self, remote_id: &str, healthy: bool) -> HealthTransition {
        let mut inner = self.inner.write().expect("registry poisoned");
        let Some(record) = inner.by_id.get_mut(remote_id) else {
            return HealthTransition::Unchanged;
        };

        if healthy {
            record.consecutive_failures = 0;
            record.degraded = false;
            return HealthTransition::Unchanged;
        }

        record.consecutive_failures += 1;
        if record.consecutive_failures >= UNREGISTER_AFTER {
            let record = inner.by_id.remove(remote_id).expect("checked above");
            inner.by_name.remove(&record.name);
            inner.session_index.retain(|_, rid| rid != remote_id);
            HealthTransition::Unregistered
        } else if record.consecutive_failures == DEGRADED_AFTER {
            record.degraded = true;
            HealthTransition::Degraded
        } else {
            HealthTransition::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = RemoteRegistry::new();
        let r = registry.register(
            "r-0".to_string(),
            "http://r0:4020".to_string(),
            "tok".to_string(),
        );
        assert_eq!(registry.get(&r.id).unwrap().name, "r-0");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_same_name_replaces() {
        let registry = RemoteRegistry::new();
        let old = registry.register(
            "r-0".to_string(),
            "http://a:1".to_string(),
            "t1".to_string(),
        );
        registry.update_sessions(&old.id, vec!["s1".to_string()]);
        let new = registry.register(
            "r-0".to_string(),
            "http://b:2".to_string(),
            "t2".to_string(),
        );
        assert_ne!(old.id, new.id);
        assert!(registry.get(&old.id).is_none());
        assert_eq!(registry.list().len(), 1);
        // Old session cache is gone too.
        assert!(registry.remote_for_session("s1").is_none());
    }

    #[test]
    fn test_session_index() {
        let registry = RemoteRegistry::new();
        let r = registry.register("r".to_string(), "u".to_string(), "t".to_string());
        registry.update_sessions(&r.id, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(registry.remote_for_session("s1").unwrap().id, r.id);
        assert_eq!(registry.remote_for_session("s2").unwrap().id, r.id);
        assert!(registry.remote_for_session("s3").is_none());

        registry.update_sessions(&r.id, vec!["s3".to_string()]);
        assert!(registry.remote_for_session("s1").is_none());
        assert_eq!(registry.remote_for_session("s3").unwrap().id, r.id);
    }

    #[test]
    fn test_health_transitions() {
        let registry = RemoteRegistry::new();
        let r = registry.register("r".to_string(), "u".to_string(), "t".to_string());

        for _ in 0..DEGRADED_AFTER - 1 {
            assert_eq!(
                registry.record_health(&r.id, false),
                HealthTransition::Unchanged
            );
        }
        assert_eq!(
            registry.record_health(&r.id, false),
            HealthTransition::Degraded
        );
        assert!(registry.get(&r.id).unwrap().degraded);

        // Recovery clears the failure streak.
        assert_eq!(
            registry.record_health(&r.id, true),
            HealthTransition::Unchanged
        );
        assert!(!registry.get(&r.id).unwrap().degraded);

        for _ in 0..UNREGISTER_AFTER - 1 {
            registry.record_health(&r.id, false);
        }
        assert_eq!(
            registry.record_health(&r.id, false),
            HealthTransition::Unregistered
        );
        assert!(registry.get(&r.id).is_none());
    }

    #[test]
    fn test_token_not_serialized() {
        let registry = RemoteRegistry::new();
        let r = registry.register("r".to_string(), "u".to_string(), "secret".to_string());
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("registeredAt"));
    }
}
