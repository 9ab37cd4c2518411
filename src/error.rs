//! Error types for the session substrate and the HTTP surface.
//!
//! Two layers: [`SessionError`] is produced by the session manager and PTY
//! machinery; [`ApiError`] is the HTTP-facing classification that maps onto
//! response status codes. Handlers convert with `From<SessionError>` so the
//! mapping lives in one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors from session lifecycle operations.
#[derive(Debug)]
pub enum SessionError {
    /// Bad spec, dimensions, unknown command, nonexistent working dir.
    InvalidArgument(String),
    /// Unknown session id.
    NotFound(String),
    /// Id collision on create.
    AlreadyExists(String),
    /// Operation disallowed by server policy.
    Disabled(String),
    /// PTY allocation or child spawn failed.
    PtyCreationFailed(String),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            SessionError::NotFound(id) => write!(f, "session {id} not found"),
            SessionError::AlreadyExists(id) => write!(f, "session {id} already exists"),
            SessionError::Disabled(m) => write!(f, "operation disabled: {m}"),
            SessionError::PtyCreationFailed(m) => write!(f, "pty creation failed: {m}"),
            SessionError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// HTTP-facing error with a status mapping and machine-readable code.
///
/// Serialized as `{"error": "...", "code": "..."}`. Messages never echo raw
/// client input back verbatim.
#[derive(Debug)]
pub enum ApiError {
    InvalidArgument(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Upstream(String),
    Canceled(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            // 499 is nginx's "client closed request"; axum has no constant for it.
            ApiError::Canceled(_) => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Upstream(_) => "UPSTREAM",
            ApiError::Canceled(_) => "CANCELED",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::InvalidArgument(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Upstream(m)
            | ApiError::Canceled(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!("internal error: {}", self.message());
        }
        let body = Json(json!({
            "error": self.message(),
            "code": self.code(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidArgument(m) => ApiError::InvalidArgument(m),
            SessionError::NotFound(id) => ApiError::NotFound(format!("session {id} not found")),
            SessionError::AlreadyExists(id) => {
                ApiError::Conflict(format!("session {id} already exists"))
            }
            SessionError::Disabled(m) => ApiError::Forbidden(m),
            SessionError::PtyCreationFailed(m) => ApiError::Internal(m),
            SessionError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::InvalidArgument(String::new()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound(String::new()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict(String::new()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Upstream(String::new()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::Canceled(String::new()).status().as_u16(), 499);
    }

    #[test]
    fn test_session_error_conversion() {
        let api: ApiError = SessionError::Disabled("column resize off".into()).into();
        assert_eq!(api.status(), StatusCode::FORBIDDEN);
        let api: ApiError = SessionError::AlreadyExists("abc".into()).into();
        assert_eq!(api.code(), "CONFLICT");
    }
}
