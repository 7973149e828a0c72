use serde::Deserialize;
use serde_json::Value;

use super::types::{ConversationId, ConversationSummary, MessageId, Presence, ServerMessage, UserId};

/// Events the transport layer forwards to the sync layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    /// Server finished authenticating the socket (`connected` event).
    ServerReady,
    Disconnected {
        reason: String,
    },
    ConnectError(String),
    Push(PushEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageEdit {
    pub id: i64,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRemoval {
    pub id: i64,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub reader_id: Option<UserId>,
}

/// Server-initiated events the client subscribes to.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NewMessage(ServerMessage),
    MessageEdited(MessageEdit),
    MessageDeleted(MessageRemoval),
    ConversationUpdated(ConversationSummary),
    ConversationRead(ReadReceipt),
    PresenceUpdate(Presence),
}

impl PushEvent {
    /// Decode a named push. Unknown event names yield `Ok(None)`.
    pub fn decode(event: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        let push = match event {
            "new_message" => Self::NewMessage(serde_json::from_value(data)?),
            "message_edited" => Self::MessageEdited(serde_json::from_value(data)?),
            "message_deleted" => Self::MessageDeleted(serde_json::from_value(data)?),
            "conversation_updated" => Self::ConversationUpdated(serde_json::from_value(data)?),
            "conversation_read" => Self::ConversationRead(serde_json::from_value(data)?),
            "presence_update" => Self::PresenceUpdate(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(push))
    }
}

/// Notifications from the sync layer to whoever renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    MessagesChanged(ConversationId),
    SendFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
    MutationReverted {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
    RoomJoined(ConversationId),
    InboxChanged,
    PresenceChanged(UserId),
    ServerReady,
    ConnectionLost(String),
    SessionExpired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_pushes() {
        let push = PushEvent::decode(
            "new_message",
            json!({"id": 4, "conversation_id": 2, "content": "hey", "sender_id": 8}),
        )
        .unwrap();
        assert!(matches!(push, Some(PushEvent::NewMessage(m)) if m.id == 4));

        let presence = PushEvent::decode(
            "presence_update",
            json!({"user_id": 8, "is_online": 1}),
        )
        .unwrap();
        assert_eq!(
            presence,
            Some(PushEvent::PresenceUpdate(Presence {
                user_id: 8,
                is_online: true,
                last_seen: None,
            }))
        );
    }

    #[test]
    fn unknown_push_is_ignored() {
        assert_eq!(PushEvent::decode("new_match", json!({})).unwrap(), None);
    }

    #[test]
    fn malformed_push_is_an_error() {
        assert!(PushEvent::decode("message_deleted", json!({"nope": true})).is_err());
    }
}
