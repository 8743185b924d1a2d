//! Control-channel wire format.
//!
//! Control messages travel as JSON text frames over the WebSocket; processed
//! frames travel as binary messages carrying one complete JPEG image each,
//! with no framing beyond the transport's own message boundary.

use serde::{Deserialize, Serialize};

/// Messages exchanged on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Sent once immediately after the connection opens. The server closes
    /// the connection if the credential is rejected; there is no explicit
    /// rejection payload.
    Auth { credential: String },
    /// Heartbeat request, sent periodically while active.
    Ping,
    /// Heartbeat response; also implied by any binary frame.
    Pong,
}

impl ControlMessage {
    /// Serialize to the JSON text-frame payload.
    pub fn to_json(&self) -> String {
        // The enum has no unserializable states; this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a text-frame payload. Unknown or malformed messages yield None
    /// and are ignored by the session loop.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_wire_shape() {
        let msg = ControlMessage::Auth {
            credential: "secret".into(),
        };
        assert_eq!(msg.to_json(), r#"{"type":"auth","credential":"secret"}"#);
    }

    #[test]
    fn heartbeat_wire_shape() {
        assert_eq!(ControlMessage::Ping.to_json(), r#"{"type":"ping"}"#);
        assert_eq!(
            ControlMessage::parse(r#"{"type":"pong"}"#),
            Some(ControlMessage::Pong)
        );
    }

    #[test]
    fn malformed_text_is_ignored() {
        assert_eq!(ControlMessage::parse("not json"), None);
        assert_eq!(ControlMessage::parse(r#"{"type":"reboot"}"#), None);
    }
}
