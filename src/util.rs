//! Small helpers shared across modules.

use std::borrow::Cow;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{SecondsFormat, Utc};

/// Connection peer address, when available.
///
/// axum's `ConnectInfo` extractor has no blanket `Option<T>` impl (unlike
/// most other extractors), so this wraps it to stay infallible for
/// handlers that want to degrade gracefully when connect info wasn't
/// attached (e.g. a handler invoked without
/// `into_make_service_with_connect_info`).
pub struct OptionalPeerAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for OptionalPeerAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalPeerAddr(
            ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
                .await
                .ok()
                .map(|ConnectInfo(addr)| addr),
        ))
    }
}

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Current wall-clock time as an ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/var/lib"), "/var/lib");
        assert_eq!(expand_tilde("relative/path"), "relative/path");
    }

    #[test]
    fn test_expand_tilde_home() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(expand_tilde("~"), "/home/test");
        assert_eq!(expand_tilde("~/x/y"), "/home/test/x/y");
        // "~user" style is not expanded
        assert_eq!(expand_tilde("~root/x"), "~root/x");
    }

    #[test]
    fn test_now_iso8601_shape() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
