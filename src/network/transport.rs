use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

pub const JOIN_CONVERSATION: &str = "join_conversation";
pub const LEAVE_CONVERSATION: &str = "leave_conversation";
pub const SEND_MESSAGE: &str = "send_message";
pub const EDIT_MESSAGE: &str = "edit_message";
pub const DELETE_MESSAGE: &str = "delete_message";
pub const MARK_READ: &str = "mark_read";
/// Emitted by the server once the socket is authenticated.
pub const SERVER_READY: &str = "connected";

/// Real-time channel to the backend.
///
/// `emit_with_ack` resolves with the server's reply to that specific
/// emit; it is not bounded by a timeout, callers apply their own.
pub trait RealtimeTransport: Send + Sync + 'static {
    fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Fire-and-forget emit.
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// One JSON text frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack { id: u64, data: Value },
    Event { name: String, data: Value },
}

impl Frame {
    pub fn emit(event: &str, data: Value, ack: Option<u64>) -> Self {
        Self {
            event: Some(event.to_string()),
            data,
            ack,
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Inbound, TransportError> {
        let frame: Frame = serde_json::from_str(text)?;
        match (frame.event, frame.ack) {
            // A named frame is a push even if the server numbers it.
            (Some(name), _) => Ok(Inbound::Event {
                name,
                data: frame.data,
            }),
            (None, Some(id)) => Ok(Inbound::Ack {
                id,
                data: frame.data,
            }),
            (None, None) => Err(TransportError::Encode(serde::de::Error::custom(
                "frame has neither event nor ack",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_frame_encodes_ack_id() {
        let text = Frame::emit(JOIN_CONVERSATION, json!({"conversation_id": 3}), Some(7))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "join_conversation");
        assert_eq!(value["ack"], 7);
    }

    #[test]
    fn fire_and_forget_frame_has_no_ack_field() {
        let text = Frame::emit(MARK_READ, json!({}), None).encode().unwrap();
        assert!(!text.contains("ack"));
    }

    #[test]
    fn decode_distinguishes_acks_and_events() {
        assert_eq!(
            Frame::decode(r#"{"ack": 2, "data": {"ok": true}}"#).unwrap(),
            Inbound::Ack {
                id: 2,
                data: json!({"ok": true})
            }
        );
        assert_eq!(
            Frame::decode(r#"{"event": "presence_update", "data": {"user_id": 1}}"#).unwrap(),
            Inbound::Event {
                name: "presence_update".into(),
                data: json!({"user_id": 1})
            }
        );
        assert!(Frame::decode(r#"{"data": 1}"#).is_err());
        assert!(Frame::decode("not json").is_err());
    }
}
