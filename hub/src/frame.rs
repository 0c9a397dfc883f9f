use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every frame exchanged with a live client.
///
/// Decoded once at the transport boundary and matched exhaustively afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Business payload.
    Event { topic: String, payload: Value },
    /// Liveness check sent by the server.
    Ping,
    /// Liveness response.
    Pong,
    /// Graceful teardown.
    Close { reason: CloseReason },
}

/// Why a session left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    HeartbeatTimeout,
    BufferOverflow,
    GoingAway,
    TransportError,
}

impl Frame {
    /// Frame type name as it appears on the wire.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Event { .. } => "event",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Close { .. } => "close",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<&events::Event> for Frame {
    fn from(event: &events::Event) -> Self {
        Frame::Event {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
        }
    }
}

impl CloseReason {
    /// WebSocket close code for this reason (RFC 6455, section 7.4.1).
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientDisconnect => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::BufferOverflow => 1008,
            CloseReason::HeartbeatTimeout | CloseReason::TransportError => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::BufferOverflow => "buffer_overflow",
            CloseReason::GoingAway => "going_away",
            CloseReason::TransportError => "transport_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_snake_case_type_tag() {
        let close = Frame::Close {
            reason: CloseReason::BufferOverflow,
        };
        assert_eq!(
            serde_json::to_value(&close).unwrap(),
            json!({"type": "close", "reason": "buffer_overflow"})
        );
        assert_eq!(
            serde_json::to_value(Frame::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn client_pong_text_decodes() {
        assert_eq!(Frame::from_json(r#"{"type":"pong"}"#).unwrap(), Frame::Pong);
        assert!(Frame::from_json(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn event_frame_carries_topic_and_payload() {
        let event = events::Event::new(
            "tasks",
            events::Audience::channel("org-42"),
            json!({"id": 7}),
        );
        let frame = Frame::from(&event);
        assert_eq!(frame.frame_type(), "event");
        assert_eq!(
            frame,
            Frame::Event {
                topic: "tasks".to_string(),
                payload: json!({"id": 7})
            }
        );
    }

    #[test]
    fn close_reason_codes() {
        assert_eq!(CloseReason::GoingAway.code(), 1001);
        assert_eq!(CloseReason::BufferOverflow.code(), 1008);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 1011);
        assert_eq!(CloseReason::ClientDisconnect.as_str(), "client_disconnect");
    }
}
