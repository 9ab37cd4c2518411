//! Bearer-token authentication.
//!
//! Every endpoint except `/api/health` requires `Authorization: Bearer
//! <token>`. The WebSocket path accepts `?token=` instead, since browsers
//! cannot set headers on WebSocket upgrades.
//!
//! Accepted tokens: the locally configured token (if any) and, on a node
//! registered with an HQ, the bearer token issued to that HQ at
//! registration. Loopback connections may bypass authentication entirely
//! when `--allow-local-bypass` is set. `--no-auth` disables the whole check.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::AuthConfig;
use crate::error::ApiError;

/// Immutable-ish auth policy shared with every handler. The HQ token slot is
/// writable because remote registration happens after startup.
#[derive(Clone)]
pub struct AuthPolicy {
    enabled: bool,
    local_token: Option<String>,
    allow_local_bypass: bool,
    hq_token: Arc<RwLock<Option<String>>>,
}

impl AuthPolicy {
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self {
            enabled: auth.enabled,
            local_token: auth.local_token.clone(),
            allow_local_bypass: auth.allow_local_bypass,
            hq_token: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the bearer token handed to the HQ at registration; requests
    /// presenting it authenticate from then on.
    pub fn set_hq_token(&self, token: String) {
        *self.hq_token.write().expect("auth policy poisoned") = Some(token);
    }

    /// Validate a presented bearer token.
    pub fn token_valid(&self, presented: &str) -> bool {
        if let Some(ref local) = self.local_token {
            if constant_time_eq(local.as_bytes(), presented.as_bytes()) {
                return true;
            }
        }
        if let Some(ref hq) = *self.hq_token.read().expect("auth policy poisoned") {
            if constant_time_eq(hq.as_bytes(), presented.as_bytes()) {
                return true;
            }
        }
        false
    }

    /// Full request check: bypass switches, then bearer validation.
    pub fn allows(&self, peer: Option<SocketAddr>, bearer: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        if self.allow_local_bypass && peer.is_some_and(|a| a.ip().is_loopback()) {
            return true;
        }
        bearer.is_some_and(|t| self.token_valid(t))
    }
}

/// Axum middleware enforcing [`AuthPolicy`] on HTTP routes.
pub async fn require_auth(request: Request, next: Next) -> Response {
    let Some(policy) = request.extensions().get::<AuthPolicy>().cloned() else {
        return ApiError::Internal("auth policy not configured".to_string()).into_response();
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    if policy.allows(peer, bearer) {
        next.run(request).await
    } else {
        ApiError::Unauthorized("missing or invalid credentials".to_string()).into_response()
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so response times don't reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: bool, token: Option<&str>, bypass: bool) -> AuthPolicy {
        AuthPolicy::from_config(&AuthConfig {
            enabled,
            local_token: token.map(ToString::to_string),
            allow_local_bypass: bypass,
            enable_ssh_keys: false,
            disallow_user_password: false,
        })
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_disabled_allows_anything() {
        let p = policy(false, None, false);
        assert!(p.allows(None, None));
    }

    #[test]
    fn test_token_validation() {
        let p = policy(true, Some("tok"), false);
        assert!(p.allows(None, Some("tok")));
        assert!(!p.allows(None, Some("bad")));
        assert!(!p.allows(None, None));
    }

    #[test]
    fn test_local_bypass() {
        let p = policy(true, Some("tok"), true);
        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let external: SocketAddr = "10.0.0.5:9999".parse().unwrap();
        assert!(p.allows(Some(loopback), None));
        assert!(!p.allows(Some(external), None));
        assert!(p.allows(Some(external), Some("tok")));
    }

    #[test]
    fn test_hq_token_accepted_after_set() {
        let p = policy(true, None, false);
        assert!(!p.allows(None, Some("hq-tok")));
        p.set_hq_token("hq-tok".to_string());
        assert!(p.allows(None, Some("hq-tok")));
    }
}
