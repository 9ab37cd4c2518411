//! Wire format of the `/buffers` WebSocket.
//!
//! Control messages are JSON text frames. Buffer updates are binary frames:
//!
//! ```text
//! byte 0        0xBF magic
//! bytes 1..5    little-endian u32 length L of the session id
//! bytes 5..5+L  UTF-8 session id
//! bytes 5+L..   terminal buffer payload (see `term::encode`)
//! ```

use serde::{Deserialize, Serialize};

/// First byte of every binary buffer frame.
pub const BUFFER_MAGIC: u8 = 0xBF;

/// Client → server control frames.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping,
    Pong,
}

/// Server → client control frames.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        version: u32,
    },
    Subscribed {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping,
    Pong,
}

/// Envelope a buffer payload with the magic and session id.
pub fn encode_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    let id_bytes = session_id.as_bytes();
    let mut frame = Vec::with_capacity(5 + id_bytes.len() + payload.len());
    frame.push(BUFFER_MAGIC);
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(id_bytes);
    frame.extend_from_slice(payload);
    frame
}

/// Extract the session id from a binary frame, if well-formed.
pub fn frame_session_id(frame: &[u8]) -> Option<&str> {
    if frame.len() < 5 || frame[0] != BUFFER_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes(frame[1..5].try_into().ok()?) as usize;
    let id_bytes = frame.get(5..5 + len)?;
    std::str::from_utf8(id_bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame("sess-42", b"payload");
        assert_eq!(frame[0], BUFFER_MAGIC);
        assert_eq!(frame_session_id(&frame), Some("sess-42"));
        assert_eq!(&frame[5 + 7..], b"payload");
    }

    #[test]
    fn test_frame_rejects_bad_magic() {
        let mut frame = encode_frame("abc", b"x");
        frame[0] = 0x00;
        assert_eq!(frame_session_id(&frame), None);
    }

    #[test]
    fn test_frame_rejects_truncated() {
        let frame = encode_frame("abcdef", b"");
        assert_eq!(frame_session_id(&frame[..6]), None);
        assert_eq!(frame_session_id(&[]), None);
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                session_id: "s1".to_string()
            }
        );
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_string(&ServerMessage::Connected { version: 1 }).unwrap();
        assert_eq!(json, r#"{"type":"connected","version":1}"#);
        let json = serde_json::to_string(&ServerMessage::Subscribed {
            session_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"subscribed","sessionId":"s1"}"#);
    }
}
