/// Error types for the chat client
use thiserror::Error;

use crate::common::{ConversationId, MessageId};

/// Failures of the REST collaborator.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message} (status {status})")]
    Status { status: u16, message: String },

    #[error("session expired")]
    SessionExpired,

    #[error("Serialization error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response did not carry an auth token")]
    MissingToken,

    #[error("upload succeeded but no URL returned")]
    MissingUploadUrl,
}

/// Failures of the real-time transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket not connected")]
    NotConnected,

    #[error("connection lost before acknowledgement")]
    ConnectionLost,

    #[error("transport closed")]
    Closed,

    #[error("outgoing queue full")]
    QueueFull,

    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[derive(Error, Debug)]
#[error("Storage error: {0}")]
pub struct StorageError(#[from] pub rusqlite::Error);

/// Outcomes of conversation operations, as surfaced to the caller.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("history for conversation {conversation_id} unavailable: {reason}")]
    HistoryUnavailable {
        conversation_id: ConversationId,
        /// Messages still displayed for the conversation.
        displayed: usize,
        consecutive_failures: u32,
        /// Whether the failure should be shown as a hard error.
        surface: bool,
        reason: String,
    },

    #[error("timed out joining conversation {conversation_id}")]
    JoinTimeout { conversation_id: ConversationId },

    #[error("server refused to join conversation {conversation_id}: {reason}")]
    JoinRejected {
        conversation_id: ConversationId,
        reason: String,
    },

    #[error("timed out sending to conversation {conversation_id}")]
    SendTimeout { conversation_id: ConversationId },

    #[error("send rejected: {reason}")]
    SendRejected { reason: String },

    #[error("session expired")]
    SessionExpired,

    #[error("attachment upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("attachment is {size} bytes, limit is {limit}")]
    AttachmentTooLarge { size: u64, limit: u64 },

    #[error("message is empty")]
    EmptyMessage,

    #[error("message {0} has not failed and cannot be resent")]
    NotResendable(MessageId),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("change to message {message_id} reverted: {reason}")]
    MutationRejected {
        message_id: MessageId,
        reason: String,
    },

    #[error("API error: {0}")]
    Api(ApiError),
}

impl SyncError {
    /// The only failure that must bubble up to force a new login.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::SessionExpired => Self::SessionExpired,
            other => Self::Api(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
