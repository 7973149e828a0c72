pub mod inbox;
pub mod room;
pub mod send;
pub mod service;
pub mod timeline;

pub use inbox::Inbox;
pub use room::{RoomMembership, RoomPhase};
pub use send::{SendMachine, SendPhase};
pub use service::{ConversationSync, ConversationView, HistoryOutcome, SyncSettings};
pub use timeline::Timeline;
