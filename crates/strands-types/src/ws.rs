//! WebSocket protocol frames for the chat service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { message: String },
    Ping,
    SubscribeNpc { npc_id: Uuid },
}

/// Server-to-client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished {
        connection_id: String,
        user_id: String,
    },
    ResponseChunk {
        chunk: String,
    },
    ResponseComplete,
    Pong,
    Error {
        message: String,
    },
    NpcStatusUpdate {
        npc_id: Uuid,
        status: Value,
    },
    SubscriptionConfirmed {
        npc_id: Uuid,
    },
    Heartbeat,
    SessionUpdate {
        active_sessions: usize,
        sessions: Vec<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_by_type_tag() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"message","message":"Hello"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Message {
                message: "Hello".to_string()
            }
        );

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn server_frames_use_snake_case_tags() {
        let json = serde_json::to_value(ServerFrame::ResponseChunk {
            chunk: "hi ".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "response_chunk");

        let json = serde_json::to_value(ServerFrame::ResponseComplete).unwrap();
        assert_eq!(json["type"], "response_complete");
    }
}
