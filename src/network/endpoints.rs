use crate::common::{ConversationId, UserId};

/// REST routes of the backend, rooted at a base URL.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn login(&self) -> String {
        format!("{}/api/auth/login/", self.base)
    }

    pub fn logout(&self) -> String {
        format!("{}/api/auth/logout/", self.base)
    }

    pub fn refresh_token(&self) -> String {
        format!("{}/api/auth/refresh/", self.base)
    }

    pub fn conversations(&self) -> String {
        format!("{}/api/chat/conversations/", self.base)
    }

    pub fn conversation(&self, id: ConversationId) -> String {
        format!("{}/api/chat/conversations/{id}/", self.base)
    }

    pub fn conversation_messages(&self, id: ConversationId) -> String {
        format!("{}/api/chat/conversations/{id}/messages/", self.base)
    }

    pub fn messages(&self) -> String {
        format!("{}/api/chat/messages/", self.base)
    }

    pub fn mark_read(&self, id: ConversationId) -> String {
        format!("{}/api/chat/conversations/{id}/mark_read/", self.base)
    }

    pub fn clear(&self, id: ConversationId) -> String {
        format!("{}/api/chat/conversations/{id}/clear/", self.base)
    }

    pub fn upload(&self) -> String {
        format!("{}/api/chat/upload/", self.base)
    }

    pub fn exists(&self, user_id: UserId) -> String {
        format!("{}/api/chat/conversations/exists/{user_id}/", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let endpoints = Endpoints::new("http://localhost:8000/");
        assert_eq!(
            endpoints.conversation_messages(5),
            "http://localhost:8000/api/chat/conversations/5/messages/"
        );
        assert_eq!(
            endpoints.exists(9),
            "http://localhost:8000/api/chat/conversations/exists/9/"
        );
    }
}
