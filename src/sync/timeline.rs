use std::collections::HashSet;

use crate::common::types::DELETED_PLACEHOLDER;
use crate::common::{Message, MessageId, MessageKind, SendState};

/// What a message looked like before a local edit or delete, so the
/// change can be undone if the server refuses it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRevision {
    pub text: String,
    pub edited: bool,
    pub deleted: bool,
}

/// Message list of one conversation: unique by id, ordered by timestamp.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(history: Vec<Message>) -> Self {
        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = history
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Insert in timestamp order. Returns `false` if the id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        self.position(id).map(|at| self.messages.remove(at))
    }

    /// Swap in a freshly fetched history. Messages still waiting on or
    /// failed in a local send are carried over.
    pub fn replace_with_history(&mut self, history: Vec<Message>) {
        let unconfirmed: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.id.is_local() && m.send_state != SendState::Confirmed)
            .collect();
        *self = Self::from_history(history);
        for message in unconfirmed {
            self.insert(message);
        }
    }

    /// Replace the optimistic `local_id` with its server copy. Returns
    /// `false` when the server copy was already present (a push beat the ack).
    pub fn confirm(&mut self, local_id: &MessageId, confirmed: Message) -> bool {
        self.remove(local_id);
        self.insert(confirmed)
    }

    /// A push of our own message may arrive before the send ack. Take the
    /// oldest message in `awaiting_ack` with the same content and put the
    /// server copy in its place. Returns the local id that was replaced.
    ///
    /// Messages not yet handed to the server are never matched: an
    /// identical message from another device is not their echo.
    pub fn adopt_echo(
        &mut self,
        echo: &Message,
        awaiting_ack: &HashSet<MessageId>,
    ) -> Option<MessageId> {
        if !echo.sender_is_local_user || self.contains(&echo.id) {
            return None;
        }
        let local_id = self
            .messages
            .iter()
            .find(|m| {
                awaiting_ack.contains(&m.id)
                    && m.is_pending()
                    && m.kind == echo.kind
                    && match echo.kind {
                        MessageKind::Text => m.text == echo.text,
                        MessageKind::Attachment => {
                            m.attachment_url.is_some() && m.attachment_url == echo.attachment_url
                        }
                    }
            })
            .map(|m| m.id.clone())?;
        self.confirm(&local_id, echo.clone());
        Some(local_id)
    }

    pub fn mark_failed(&mut self, id: &MessageId, reason: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.send_state = SendState::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    pub fn set_attachment_url(&mut self, id: &MessageId, url: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.attachment_url = Some(url.into());
                true
            }
            None => false,
        }
    }

    pub fn apply_edit(&mut self, id: &MessageId, text: impl Into<String>) -> Option<MessageRevision> {
        let message = self.get_mut(id)?;
        let revision = MessageRevision::of(message);
        message.text = text.into();
        message.edited = true;
        Some(revision)
    }

    pub fn apply_delete(&mut self, id: &MessageId) -> Option<MessageRevision> {
        let message = self.get_mut(id)?;
        let revision = MessageRevision::of(message);
        message.text = DELETED_PLACEHOLDER.to_string();
        message.deleted = true;
        Some(revision)
    }

    pub fn restore(&mut self, id: &MessageId, revision: MessageRevision) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.text = revision.text;
                message.edited = revision.edited;
                message.deleted = revision.deleted;
                true
            }
            None => false,
        }
    }

    /// Flag every message we sent as read. Returns how many changed.
    pub fn mark_read_by_peer(&mut self) -> usize {
        let mut changed = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.sender_is_local_user && !m.read_by_peer)
        {
            message.read_by_peer = true;
            changed += 1;
        }
        changed
    }

    /// Empty the list, handing back what was in it.
    pub fn clear(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }
}

impl MessageRevision {
    fn of(message: &Message) -> Self {
        Self {
            text: message.text.clone(),
            edited: message.edited,
            deleted: message.deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn server(id: i64, text: &str, secs: i64) -> Message {
        Message {
            id: MessageId::Server(id),
            text: text.to_string(),
            timestamp: at(secs),
            sender_is_local_user: false,
            read_by_peer: false,
            kind: MessageKind::Text,
            attachment_url: None,
            deleted: false,
            edited: false,
            send_state: SendState::Confirmed,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<MessageId> {
        timeline.messages().iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn history_is_sorted_and_deduplicated() {
        let timeline = Timeline::from_history(vec![
            server(2, "b", 20),
            server(1, "a", 10),
            server(2, "b again", 20),
        ]);
        assert_eq!(ids(&timeline), vec![MessageId::Server(1), MessageId::Server(2)]);
        assert_eq!(timeline.messages()[1].text, "b");
    }

    #[test]
    fn out_of_order_inserts_land_in_timestamp_order() {
        let mut timeline = Timeline::new();
        assert!(timeline.insert(server(3, "c", 30)));
        assert!(timeline.insert(server(1, "a", 10)));
        assert!(timeline.insert(server(2, "b", 20)));
        assert!(!timeline.insert(server(2, "dup", 5)));
        assert_eq!(
            ids(&timeline),
            vec![MessageId::Server(1), MessageId::Server(2), MessageId::Server(3)]
        );
    }

    #[test]
    fn confirm_swaps_temp_id_for_server_id() {
        let mut timeline = Timeline::from_history(vec![server(1, "hi", 0)]);
        let pending = Message::optimistic("yo", MessageKind::Text);
        let local_id = pending.id.clone();
        timeline.insert(pending);

        let mut confirmed = server(2, "yo", 60);
        confirmed.sender_is_local_user = true;
        assert!(timeline.confirm(&local_id, confirmed));
        assert_eq!(ids(&timeline), vec![MessageId::Server(1), MessageId::Server(2)]);
    }

    #[test]
    fn confirm_after_push_does_not_duplicate() {
        let mut timeline = Timeline::new();
        let pending = Message::optimistic("yo", MessageKind::Text);
        let local_id = pending.id.clone();
        timeline.insert(pending);
        timeline.insert(server(2, "yo", 60));

        assert!(!timeline.confirm(&local_id, server(2, "yo", 60)));
        assert_eq!(ids(&timeline), vec![MessageId::Server(2)]);
    }

    #[test]
    fn echo_of_own_message_replaces_pending_copy() {
        let mut timeline = Timeline::new();
        let pending = Message::optimistic("yo", MessageKind::Text);
        let local_id = pending.id.clone();
        timeline.insert(pending);

        let mut echo = server(9, "yo", 0);
        echo.timestamp = Utc::now() + Duration::seconds(1);
        echo.sender_is_local_user = true;
        let awaiting_ack = HashSet::from([local_id.clone()]);
        assert_eq!(timeline.adopt_echo(&echo, &awaiting_ack), Some(local_id));
        assert_eq!(ids(&timeline), vec![MessageId::Server(9)]);

        let mut other = server(10, "different", 0);
        other.sender_is_local_user = true;
        assert_eq!(timeline.adopt_echo(&other, &awaiting_ack), None);
    }

    #[test]
    fn echo_leaves_messages_not_yet_sent_alone() {
        let mut timeline = Timeline::new();
        let pending = Message::optimistic("yo", MessageKind::Text);
        let local_id = pending.id.clone();
        timeline.insert(pending);

        let mut echo = server(9, "yo", 0);
        echo.sender_is_local_user = true;
        assert_eq!(timeline.adopt_echo(&echo, &HashSet::new()), None);
        assert!(timeline.contains(&local_id));
    }

    #[test]
    fn refresh_keeps_unconfirmed_local_messages() {
        let mut timeline = Timeline::from_history(vec![server(1, "hi", 0)]);
        let pending = Message::optimistic("still sending", MessageKind::Text);
        let local_id = pending.id.clone();
        timeline.insert(pending);

        timeline.replace_with_history(vec![server(1, "hi", 0), server(2, "new", 10)]);
        assert_eq!(timeline.len(), 3);
        assert!(timeline.contains(&local_id));
    }

    #[test]
    fn edit_and_delete_can_be_rolled_back() {
        let mut timeline = Timeline::from_history(vec![server(1, "original", 0)]);
        let id = MessageId::Server(1);

        let revision = timeline.apply_edit(&id, "changed").unwrap();
        assert!(timeline.get(&id).unwrap().edited);
        timeline.restore(&id, revision);
        assert_eq!(timeline.get(&id).unwrap().text, "original");
        assert!(!timeline.get(&id).unwrap().edited);

        let revision = timeline.apply_delete(&id).unwrap();
        assert_eq!(timeline.get(&id).unwrap().text, DELETED_PLACEHOLDER);
        timeline.restore(&id, revision);
        assert!(!timeline.get(&id).unwrap().deleted);

        assert!(timeline.apply_edit(&MessageId::Server(42), "x").is_none());
    }

    #[test]
    fn read_receipt_only_touches_own_messages() {
        let mut mine = server(2, "mine", 10);
        mine.sender_is_local_user = true;
        let mut timeline = Timeline::from_history(vec![server(1, "theirs", 0), mine]);

        assert_eq!(timeline.mark_read_by_peer(), 1);
        assert_eq!(timeline.mark_read_by_peer(), 0);
        assert!(!timeline.get(&MessageId::Server(1)).unwrap().read_by_peer);
    }
}
