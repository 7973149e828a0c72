use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub type ConversationId = i64;
pub type UserId = i64;

/// Text shown in place of a message removed by its author.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted.";

static VIDEO_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(mp4|webm|mov|mkv)$").expect("valid video regex"));
static AUDIO_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(mp3|wav|ogg|m4a)$").expect("valid audio regex"));

/// Identity of a message in a conversation timeline.
///
/// Server-assigned ids are numeric; optimistic messages carry a locally
/// generated `tmp-...` id until the server confirms them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Server(i64),
    Local(String),
}

impl MessageId {
    pub fn local() -> Self {
        Self::Local(format!("tmp-{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn server_id(&self) -> Option<i64> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => f.write_str(id),
        }
    }
}

impl FromStr for MessageId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(id) => Self::Server(id),
            Err(_) => Self::Local(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Attachment,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
}

impl AttachmentKind {
    /// Classify an uploaded file by the extension of its URL.
    pub fn from_url(url: &str) -> Self {
        if VIDEO_URL.is_match(url) {
            Self::Video
        } else if AUDIO_URL.is_match(url) {
            Self::Audio
        } else {
            Self::Image
        }
    }
}

/// Delivery state of a message authored on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Confirmed,
    Failed { reason: String },
}

/// A message as held in a conversation timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub sender_is_local_user: bool,
    pub read_by_peer: bool,
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub deleted: bool,
    pub edited: bool,
    pub send_state: SendState,
}

impl Message {
    /// Build the optimistic placeholder shown while a send is in flight.
    pub fn optimistic(text: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: MessageId::local(),
            text: text.into(),
            timestamp: Utc::now(),
            sender_is_local_user: true,
            read_by_peer: false,
            kind,
            attachment_url: None,
            deleted: false,
            edited: false,
            send_state: SendState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.send_state == SendState::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.send_state, SendState::Failed { .. })
    }

    pub fn attachment_kind(&self) -> Option<AttachmentKind> {
        self.attachment_url.as_deref().map(AttachmentKind::from_url)
    }
}

/// Message shape returned by REST history, push events and send acks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: i64,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub read: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub deleted: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub edited: bool,
}

impl ServerMessage {
    pub fn into_message(self, local_user: UserId) -> Message {
        let kind = match self.kind.as_deref() {
            Some("attachment" | "image" | "audio" | "video" | "file") => MessageKind::Attachment,
            _ if self.attachment_url.is_some() => MessageKind::Attachment,
            _ => MessageKind::Text,
        };
        let text = if self.deleted {
            DELETED_PLACEHOLDER.to_string()
        } else {
            self.content
        };

        Message {
            id: MessageId::Server(self.id),
            text,
            timestamp: self.timestamp.or(self.created_at).unwrap_or_else(Utc::now),
            sender_is_local_user: self.sender_id == Some(local_user),
            read_by_peer: self.read,
            kind,
            attachment_url: self.attachment_url,
            deleted: self.deleted,
            edited: self.edited,
            send_state: SendState::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    #[serde(default = "default_user_name")]
    pub name: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// Conversation metadata from the detail endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetails {
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_match: bool,
}

impl ConversationDetails {
    /// The participant who is not the local user.
    pub fn peer_of(&self, local_user: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != local_user)
    }
}

/// Inbox row, from the conversation list or a `conversation_updated` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub other_user_id: Option<UserId>,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_online: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_match: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

impl ConversationSummary {
    pub fn display_name(&self) -> &str {
        self.other_user_name.as_deref().unwrap_or("User")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Payload of a `send_message` emit or of the REST send fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

impl OutgoingMessage {
    pub fn text(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            kind: MessageKind::Text,
            attachment_url: None,
        }
    }

    pub fn attachment(
        conversation_id: ConversationId,
        content: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            kind: MessageKind::Attachment,
            attachment_url: Some(url.into()),
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "conversation_id": self.conversation_id,
            "content": self.content,
            "type": self.kind.as_str(),
        });
        if let Some(url) = &self.attachment_url {
            payload["attachment_url"] = Value::String(url.clone());
        }
        payload
    }
}

/// Reply carried by a transport acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AckReply {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: Option<ServerMessage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AckReply {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_else(|err| Self {
            ok: false,
            message: None,
            error: Some(format!("malformed acknowledgement: {err}")),
        })
    }

    pub fn rejection_reason(&self, fallback: &str) -> String {
        self.error.clone().unwrap_or_else(|| fallback.to_string())
    }
}

/// A file picked for sending.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn label(&self) -> &'static str {
        if self.mime_type.starts_with("image/") {
            "Photo"
        } else if self.mime_type.starts_with("audio/") {
            "Voice message"
        } else {
            "Attachment"
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn default_user_name() -> String {
    "User".to_string()
}

/// Accept `true`, `1`, `"true"`, `"1"` and `null` the way the backend emits them.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_maps_sender_and_kind() {
        let raw = json!({
            "id": 7,
            "conversation_id": 3,
            "content": "hello",
            "sender_id": 42,
            "created_at": "2024-05-01T10:00:00Z",
            "read": "true",
            "attachment_url": "https://cdn.example/v.MP4"
        });
        let server: ServerMessage = serde_json::from_value(raw).unwrap();
        let message = server.into_message(42);

        assert_eq!(message.id, MessageId::Server(7));
        assert!(message.sender_is_local_user);
        assert!(message.read_by_peer);
        assert_eq!(message.kind, MessageKind::Attachment);
        assert_eq!(message.attachment_kind(), Some(AttachmentKind::Video));
        assert_eq!(message.send_state, SendState::Confirmed);
    }

    #[test]
    fn deleted_server_message_uses_placeholder() {
        let raw = json!({"id": 1, "content": "secret", "deleted": 1});
        let server: ServerMessage = serde_json::from_value(raw).unwrap();
        let message = server.into_message(5);
        assert!(message.deleted);
        assert_eq!(message.text, DELETED_PLACEHOLDER);
        assert!(!message.sender_is_local_user);
    }

    #[test]
    fn message_id_parses_server_and_local_forms() {
        assert_eq!("12".parse::<MessageId>().unwrap(), MessageId::Server(12));
        let local: MessageId = "tmp-abc".parse().unwrap();
        assert!(local.is_local());
        assert!(MessageId::local().to_string().starts_with("tmp-"));
    }

    #[test]
    fn outgoing_payload_only_carries_url_for_attachments() {
        let text = OutgoingMessage::text(9, "yo").to_payload();
        assert_eq!(text["type"], "text");
        assert!(text.get("attachment_url").is_none());

        let file = OutgoingMessage::attachment(9, "Photo", "https://x/y.png").to_payload();
        assert_eq!(file["type"], "attachment");
        assert_eq!(file["attachment_url"], "https://x/y.png");
    }

    #[test]
    fn malformed_ack_is_a_rejection() {
        let ack = AckReply::from_value(json!("nope"));
        assert!(!ack.ok);
        assert!(ack.rejection_reason("x").starts_with("malformed"));
    }

    #[test]
    fn attachment_label_follows_mime_type() {
        let mut file = Attachment {
            file_name: "a.png".into(),
            mime_type: "image/png".into(),
            bytes: vec![1, 2],
        };
        assert_eq!(file.label(), "Photo");
        file.mime_type = "audio/webm".into();
        assert_eq!(file.label(), "Voice message");
        file.mime_type = "application/pdf".into();
        assert_eq!(file.label(), "Attachment");
        assert_eq!(file.size(), 2);
    }
}
