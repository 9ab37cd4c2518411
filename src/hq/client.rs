//! Remote-side HQ registration.
//!
//! A node started with `--hq-url` registers itself on startup: it generates
//! a bearer token, installs it in the local auth policy, and POSTs
//! `{name, url, token}` to the HQ's `/api/remotes` with the HQ admin
//! credentials. The HQ presents that token on every request it makes back.
//!
//! Registration retries with exponential backoff capped at 30 s; auth
//! rejections are permanent and stop the client. After a successful
//! registration the client periodically verifies the HQ still knows it and
//! re-registers when it doesn't (an HQ restart loses the registry).

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthPolicy;
use crate::config::HqConfig;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const VERIFY_INTERVAL: Duration = Duration::from_secs(15);

/// Classification of registration failures for the backoff strategy.
enum RegisterError {
    /// Credentials rejected — stop retrying entirely.
    Permanent(String),
    /// Connection failure or transient server error — back off and retry.
    Transient(String),
}

/// Spawn the registration client. Returns a `JoinHandle` that runs until a
/// permanent error occurs.
pub fn spawn(
    hq: HqConfig,
    advertise_url: String,
    auth: AuthPolicy,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(registration_loop(hq, advertise_url, auth))
}

async fn registration_loop(hq: HqConfig, advertise_url: String, auth: AuthPolicy) {
    let hq_url = hq.url.clone().expect("hq.url required for remote mode");
    let name = hq.name.clone().expect("hq.name required for remote mode");
    let username = hq.username.clone().unwrap_or_default();
    let password = hq.password.clone().unwrap_or_default();

    // The token the HQ will use against us, valid for this process lifetime.
    let token = Uuid::new_v4().to_string();
    auth.set_hq_token(token.clone());

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let basic = BASE64.encode(format!("{username}:{password}"));
    let mut delay = Duration::from_secs(1);

    loop {
        match register_once(&client, &hq_url, &basic, &name, &advertise_url, &token).await {
            Ok(()) => {
                info!("Registered with HQ at {hq_url} as '{name}'");
                delay = Duration::from_secs(1);
                // Watch for the HQ forgetting us (restart, eviction).
                loop {
                    tokio::time::sleep(VERIFY_INTERVAL).await;
                    match still_registered(&client, &hq_url, &basic, &name).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("HQ no longer lists '{name}', re-registering");
                            break;
                        }
                        Err(e) => {
                            warn!("HQ verification failed ({e}), re-registering");
                            break;
                        }
                    }
                }
            }
            Err(RegisterError::Permanent(msg)) => {
                error!("HQ registration rejected: {msg} — giving up");
                return;
            }
            Err(RegisterError::Transient(msg)) => {
                warn!(
                    "HQ registration failed: {msg}, retrying in {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }
}

async fn register_once(
    client: &Client<HttpConnector, Full<Bytes>>,
    hq_url: &str,
    basic: &str,
    name: &str,
    advertise_url: &str,
    token: &str,
) -> Result<(), RegisterError> {
    let body = json!({
        "name": name,
        "url": advertise_url,
        "token": token,
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("{}/api/remotes", hq_url.trim_end_matches('/')))
        .header("authorization", format!("Basic {basic}"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .map_err(|e| RegisterError::Transient(format!("build request: {e}")))?;

    let response = tokio::time::timeout(REGISTRATION_TIMEOUT, client.request(request))
        .await
        .map_err(|_| RegisterError::Transient("registration timed out".to_string()))?
        .map_err(|e| RegisterError::Transient(e.to_string()))?;

    match response.status() {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegisterError::Permanent(
            "HQ rejected the provided credentials".to_string(),
        )),
        s => Err(RegisterError::Transient(format!("HQ returned {s}"))),
    }
}

async fn still_registered(
    client: &Client<HttpConnector, Full<Bytes>>,
    hq_url: &str,
    basic: &str,
    name: &str,
) -> Result<bool, String> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("{}/api/remotes", hq_url.trim_end_matches('/')))
        .header("authorization", format!("Basic {basic}"))
        .body(Full::new(Bytes::new()))
        .map_err(|e| e.to_string())?;

    let response = tokio::time::timeout(REGISTRATION_TIMEOUT, client.request(request))
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HQ returned {}", response.status()));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();
    let remotes: serde_json::Value = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
    let listed = remotes
        .as_array()
        .is_some_and(|arr| arr.iter().any(|r| r["name"] == name));
    Ok(listed)
}
