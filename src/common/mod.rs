pub mod commands;
pub mod events;
pub mod types;

pub use commands::ChatCommand;
pub use events::{PushEvent, SyncEvent, TransportEvent};
pub use types::{
    AckReply, Attachment, AttachmentKind, ConversationDetails, ConversationId,
    ConversationSummary, Message, MessageId, MessageKind, OutgoingMessage, Participant, Presence,
    SendState, ServerMessage, UserId,
};
