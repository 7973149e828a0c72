use crate::common::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Left,
    Joining(ConversationId),
    Joined(ConversationId),
}

/// Issued by [`RoomMembership::begin_join`]; only the ticket of the
/// current connection can complete the join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTicket {
    conversation_id: ConversationId,
    epoch: u64,
}

/// Which room the live connection is subscribed to.
///
/// Every disconnect starts a new epoch and drops membership, so an ack
/// that was in flight across a reconnect cannot mark the room joined.
#[derive(Debug, Clone)]
pub struct RoomMembership {
    phase: RoomPhase,
    epoch: u64,
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self {
            phase: RoomPhase::Left,
            epoch: 0,
        }
    }
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn is_joined(&self, conversation_id: ConversationId) -> bool {
        self.phase == RoomPhase::Joined(conversation_id)
    }

    /// Room held (or being joined) for a conversation other than `target`.
    pub fn other_than(&self, target: ConversationId) -> Option<ConversationId> {
        match self.phase {
            RoomPhase::Joining(id) | RoomPhase::Joined(id) if id != target => Some(id),
            _ => None,
        }
    }

    pub fn begin_join(&mut self, conversation_id: ConversationId) -> JoinTicket {
        self.phase = RoomPhase::Joining(conversation_id);
        JoinTicket {
            conversation_id,
            epoch: self.epoch,
        }
    }

    /// Returns `false` if the connection dropped or the room changed
    /// while the join was in flight.
    pub fn complete_join(&mut self, ticket: JoinTicket) -> bool {
        if ticket.epoch != self.epoch || self.phase != RoomPhase::Joining(ticket.conversation_id) {
            return false;
        }
        self.phase = RoomPhase::Joined(ticket.conversation_id);
        true
    }

    pub fn abort_join(&mut self, ticket: JoinTicket) {
        if ticket.epoch == self.epoch && self.phase == RoomPhase::Joining(ticket.conversation_id) {
            self.phase = RoomPhase::Left;
        }
    }

    /// Drop membership; returns the room that was held, if any.
    pub fn leave(&mut self) -> Option<ConversationId> {
        let previous = match self.phase {
            RoomPhase::Joining(id) | RoomPhase::Joined(id) => Some(id),
            RoomPhase::Left => None,
        };
        self.phase = RoomPhase::Left;
        previous
    }

    /// Leave the joined room unless it is `target`'s. A join still in
    /// flight is left to finish. Returns the room that was left.
    pub fn leave_joined_other_than(&mut self, target: ConversationId) -> Option<ConversationId> {
        match self.phase {
            RoomPhase::Joined(id) if id != target => self.leave(),
            _ => None,
        }
    }

    /// Leave the joined room, if any. A join still in flight is left to finish.
    pub fn leave_joined(&mut self) -> Option<ConversationId> {
        match self.phase {
            RoomPhase::Joined(_) => self.leave(),
            _ => None,
        }
    }

    pub fn on_disconnect(&mut self) {
        self.epoch += 1;
        self.phase = RoomPhase::Left;
    }
}
