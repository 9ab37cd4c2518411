//! HTTP request forwarding from an HQ to its remotes.
//!
//! Unary forwards (session CRUD, input, resize, …) carry a 10 s deadline and
//! buffer the response. Streaming forwards (the SSE recording stream) have no
//! deadline — they end when the client disconnects — and hand the response
//! body through untouched.
//!
//! Inter-node traffic is plain HTTP; TLS termination is the deployer's
//! concern.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use tracing::debug;

use crate::control::SessionInfo;
use crate::error::ApiError;

use super::registry::RemoteRecord;

/// Deadline for unary forwards and fan-out requests.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// A buffered response from a remote.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Shared HTTP client for HQ → remote requests.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Issue a request to a remote with its bearer token attached. No
    /// deadline — callers wrap with one where appropriate.
    pub async fn forward_raw(
        &self,
        remote: &RemoteRecord,
        method: Method,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Response<Incoming>, ApiError> {
        let uri = format!("{}{}", remote.url.trim_end_matches('/'), path_and_query);
        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header("authorization", format!("Bearer {}", remote.token));
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ApiError::Internal(format!("build forward request: {e}")))?;

        self.client.request(request).await.map_err(|e| {
            debug!("forward to {} failed: {e}", remote.name);
            ApiError::Upstream(format!("remote {} unreachable", remote.name))
        })
    }

    /// Unary forward: 10 s deadline, buffered response.
    pub async fn forward(
        &self,
        remote: &RemoteRecord,
        method: Method,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<ForwardedResponse, ApiError> {
        let response = tokio::time::timeout(
            FORWARD_TIMEOUT,
            self.forward_raw(remote, method, path_and_query, content_type, body),
        )
        .await
        .map_err(|_| ApiError::Upstream(format!("remote {} timed out", remote.name)))??;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ApiError::Upstream(format!("remote {} body: {e}", remote.name)))?
            .to_bytes();

        Ok(ForwardedResponse {
            status,
            content_type,
            body,
        })
    }

    /// Forward and parse a JSON response, treating non-2xx as upstream
    /// failures.
    pub async fn get_json(
        &self,
        remote: &RemoteRecord,
        path_and_query: &str,
    ) -> Result<Value, ApiError> {
        let response = self
            .forward(remote, Method::GET, path_and_query, None, Bytes::new())
            .await?;
        if !response.status.is_success() {
            return Err(ApiError::Upstream(format!(
                "remote {} returned {}",
                remote.name, response.status
            )));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| ApiError::Upstream(format!("remote {} sent bad JSON: {e}", remote.name)))
    }

    /// Fetch a remote's session list.
    pub async fn fetch_sessions(
        &self,
        remote: &RemoteRecord,
    ) -> Result<Vec<SessionInfo>, ApiError> {
        let value = self.get_json(remote, "/api/sessions").await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Upstream(format!("remote {} session list: {e}", remote.name)))
    }

    /// Liveness probe against a remote.
    pub async fn health_check(&self, remote: &RemoteRecord) -> bool {
        match self
            .forward(remote, Method::GET, "/api/health", None, Bytes::new())
            .await
        {
            Ok(response) => response.status.is_success(),
            Err(_) => false,
        }
    }
}
