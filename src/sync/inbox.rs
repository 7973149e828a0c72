use chrono::{DateTime, Utc};

use crate::common::{ConversationId, ConversationSummary, Presence};

/// Conversation list, most recently updated first.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    entries: Vec<ConversationSummary>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn replace(&mut self, entries: Vec<ConversationSummary>) {
        self.entries = entries;
        self.sort();
    }

    pub fn upsert(&mut self, summary: ConversationSummary) {
        match self.entries.iter_mut().find(|e| e.id == summary.id) {
            Some(entry) => *entry = summary,
            None => self.entries.push(summary),
        }
        self.sort();
    }

    /// Record a new last message. Unknown conversations are ignored
    /// until the next `conversation_updated` or list refresh.
    pub fn touch(&mut self, id: ConversationId, preview: &str, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        entry.last_message = Some(preview.to_string());
        entry.updated_at = Some(at);
        self.sort();
        true
    }

    pub fn bump_unread(&mut self, id: ConversationId) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.unread_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn mark_read(&mut self, id: ConversationId) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) if entry.unread_count > 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn apply_presence(&mut self, presence: &Presence) -> bool {
        let mut changed = false;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.other_user_id == Some(presence.user_id))
        {
            entry.is_online = presence.is_online;
            if presence.last_seen.is_some() {
                entry.last_seen = presence.last_seen;
            }
            changed = true;
        }
        changed
    }

    pub fn remove(&mut self, id: ConversationId) -> Option<ConversationSummary> {
        let at = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(at))
    }

    /// Badge count across all conversations.
    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|e| e.unread_count).sum()
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: ConversationId, peer: i64, secs: Option<i64>, unread: u32) -> ConversationSummary {
        ConversationSummary {
            id,
            other_user_id: Some(peer),
            other_user_name: None,
            last_message: None,
            updated_at: secs.and_then(|s| DateTime::from_timestamp(s, 0)),
            unread_count: unread,
            is_online: false,
            is_match: false,
            last_seen: None,
            profile_picture: None,
        }
    }

    fn order(inbox: &Inbox) -> Vec<ConversationId> {
        inbox.entries().iter().map(|e| e.id).collect()
    }

    #[test]
    fn newest_first_with_undated_last() {
        let mut inbox = Inbox::new();
        inbox.replace(vec![summary(1, 10, Some(100), 0), summary(2, 20, None, 0), summary(3, 30, Some(300), 0)]);
        assert_eq!(order(&inbox), vec![3, 1, 2]);

        inbox.upsert(summary(2, 20, Some(400), 1));
        assert_eq!(order(&inbox), vec![2, 3, 1]);
        assert_eq!(inbox.entries().len(), 3);
    }

    #[test]
    fn unread_badge_tracks_bumps_and_reads() {
        let mut inbox = Inbox::new();
        inbox.replace(vec![summary(1, 10, Some(1), 2), summary(2, 20, Some(2), 0)]);
        assert!(inbox.bump_unread(2));
        assert!(!inbox.bump_unread(99));
        assert_eq!(inbox.total_unread(), 3);

        assert!(inbox.mark_read(1));
        assert!(!inbox.mark_read(1));
        assert_eq!(inbox.total_unread(), 1);
    }

    #[test]
    fn touch_moves_conversation_to_top() {
        let mut inbox = Inbox::new();
        inbox.replace(vec![summary(1, 10, Some(100), 0), summary(2, 20, Some(200), 0)]);
        let now = DateTime::from_timestamp(500, 0).unwrap();
        assert!(inbox.touch(1, "hey", now));
        assert_eq!(order(&inbox), vec![1, 2]);
        assert_eq!(inbox.get(1).unwrap().last_message.as_deref(), Some("hey"));
    }

    #[test]
    fn presence_updates_matching_peer() {
        let mut inbox = Inbox::new();
        inbox.replace(vec![summary(1, 10, None, 0)]);
        let online = Presence {
            user_id: 10,
            is_online: true,
            last_seen: None,
        };
        assert!(inbox.apply_presence(&online));
        assert!(inbox.get(1).unwrap().is_online);
        assert!(!inbox.apply_presence(&Presence { user_id: 11, ..online }));
    }
}
