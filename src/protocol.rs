//! Client↔server wire protocol: newline-free JSON objects with a string
//! `type` discriminant, UTF-8 text frames only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "heartbeat.ping")]
    HeartbeatPing { ts: i64 },
    #[serde(rename = "discovery.claim")]
    DiscoveryClaim {
        name: String,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
    #[serde(rename = "discovery.resolve")]
    DiscoveryResolve {
        name: String,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
    #[serde(rename = "signal.send")]
    SignalSend {
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        payload: Value,
        #[serde(rename = "deliveryId")]
        delivery_id: Option<String>,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
    #[serde(rename = "signal.ack")]
    SignalAck {
        #[serde(rename = "deliveryId")]
        delivery_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.welcome")]
    SessionWelcome {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "resumeToken")]
        resume_token: String,
        #[serde(rename = "resumeExpiresAt")]
        resume_expires_at: i64,
        peers: Vec<PeerSummary>,
    },
    #[serde(rename = "presence.joined")]
    PresenceJoined { peer: PeerSummary },
    #[serde(rename = "presence.left")]
    PresenceLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "discovery.claimed")]
    DiscoveryClaimed {
        name: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
    #[serde(rename = "discovery.resolved")]
    DiscoveryResolved {
        #[serde(rename = "requestId")]
        request_id: Option<String>,
        name: String,
        #[serde(rename = "userId")]
        user_id: Option<String>,
        peers: Vec<PeerSummary>,
    },
    #[serde(rename = "signal.message")]
    SignalMessage {
        #[serde(rename = "deliveryId")]
        delivery_id: String,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        payload: Value,
        #[serde(rename = "sentAt")]
        sent_at: i64,
    },
    #[serde(rename = "signal.acked")]
    SignalAcked {
        #[serde(rename = "deliveryId")]
        delivery_id: String,
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        at: i64,
    },
    #[serde(rename = "heartbeat.pong")]
    HeartbeatPong { ts: i64 },
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "BAD_MESSAGE")]
    BadMessage,
    #[serde(rename = "UNBOUND_SOCKET")]
    UnboundSocket,
    #[serde(rename = "SESSION_NOT_FOUND")]
    SessionNotFound,
    #[serde(rename = "UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "ALIAS_INVALID")]
    AliasInvalid,
    #[serde(rename = "ALIAS_TAKEN")]
    AliasTaken,
    #[serde(rename = "TARGET_NOT_FOUND")]
    TargetNotFound,
    #[serde(rename = "STORAGE")]
    Storage,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            request_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server messages always serialize")
    }
}

/// The kinds of decode failure a caller must distinguish: a well-formed
/// envelope with a `type` the server doesn't recognize gets `UNSUPPORTED`;
/// anything else (invalid JSON, missing `type`, a recognized type with a
/// malformed body) gets `BAD_MESSAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Malformed,
    Unsupported,
}

const KNOWN_CLIENT_TYPES: &[&str] = &[
    "heartbeat.ping",
    "discovery.claim",
    "discovery.resolve",
    "signal.send",
    "signal.ack",
];

/// Decodes a text frame. The `type` discriminant is checked against the
/// known client message variants before the typed decode runs, so an
/// unrecognized-but-well-formed `type` can be told apart from genuinely
/// malformed input.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| DecodeError::Malformed)?;
    match value.get("type").and_then(Value::as_str) {
        Some(t) if KNOWN_CLIENT_TYPES.contains(&t) => {
            serde_json::from_value(value).map_err(|_| DecodeError::Malformed)
        }
        Some(_) => Err(DecodeError::Unsupported),
        None => Err(DecodeError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_signal_send() {
        let msg = decode(
            r#"{"type":"signal.send","toPeerId":"p1","payload":{"kind":"offer"},"deliveryId":"d1"}"#,
        )
        .expect("decodes");
        match msg {
            ClientMessage::SignalSend {
                to_peer_id,
                delivery_id,
                ..
            } => {
                assert_eq!(to_peer_id, "p1");
                assert_eq!(delivery_id.as_deref(), Some("d1"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unrecognized_type_is_unsupported_not_malformed() {
        assert!(matches!(
            decode(r#"{"type":"bogus.thing"}"#),
            Err(DecodeError::Unsupported)
        ));
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed)));
    }

    #[test]
    fn missing_type_field_is_malformed() {
        assert!(matches!(
            decode(r#"{"toPeerId":"p1"}"#),
            Err(DecodeError::Malformed)
        ));
    }

    #[test]
    fn recognized_type_with_bad_body_is_malformed() {
        assert!(matches!(
            decode(r#"{"type":"signal.send","toPeerId":"p1"}"#),
            Err(DecodeError::Malformed)
        ));
    }

    #[test]
    fn encodes_welcome_with_expected_field_names() {
        let msg = ServerMessage::SessionWelcome {
            peer_id: "p1".into(),
            user_id: "alice".into(),
            room_id: "R".into(),
            resume_token: "rt".into(),
            resume_expires_at: 1000,
            peers: vec![],
        };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"session.welcome\""));
        assert!(json.contains("\"resumeToken\":\"rt\""));
        assert!(json.contains("\"resumeExpiresAt\":1000"));
    }

    #[test]
    fn error_omits_request_id_when_absent() {
        let msg = ServerMessage::error(ErrorCode::AliasTaken, "taken", None);
        let json = msg.to_json();
        assert!(!json.contains("requestId"));
    }
}
