use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::common::UserId;
use crate::error::StorageError;
use crate::storage::SessionDatabase;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionTokens {
    pub access: String,
    pub refresh: Option<String>,
    pub user_id: Option<UserId>,
}

/// Bearer credentials shared by the REST client and the socket.
///
/// Cloning is cheap; all clones see the same tokens. When built with a
/// store, every change is written through to SQLite.
#[derive(Clone, Default)]
pub struct Session {
    tokens: Arc<RwLock<Option<SessionTokens>>>,
    store: Option<Arc<Mutex<SessionDatabase>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: SessionTokens) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(Some(tokens))),
            store: None,
        }
    }

    /// Restore the last saved session from `store` and keep writing to it.
    pub fn with_store(store: SessionDatabase) -> Result<Self, StorageError> {
        let restored = store.load_session()?.map(|stored| SessionTokens {
            access: stored.access_token,
            refresh: stored.refresh_token,
            user_id: stored.user_id,
        });
        if restored.is_some() {
            log::info!("Restored saved session");
        }
        Ok(Self {
            tokens: Arc::new(RwLock::new(restored)),
            store: Some(Arc::new(Mutex::new(store))),
        })
    }

    pub async fn tokens(&self) -> Option<SessionTokens> {
        self.tokens.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.access.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.tokens
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh.clone())
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.tokens.read().await.as_ref().and_then(|t| t.user_id)
    }

    pub async fn replace(&self, tokens: SessionTokens) {
        self.persist(Some(&tokens)).await;
        *self.tokens.write().await = Some(tokens);
    }

    /// Swap in a refreshed access token, keeping the rest.
    pub async fn update_access(&self, access: String) {
        let updated = {
            let mut guard = self.tokens.write().await;
            match guard.as_mut() {
                Some(tokens) => {
                    tokens.access = access;
                    tokens.clone()
                }
                None => {
                    let tokens = SessionTokens {
                        access,
                        refresh: None,
                        user_id: None,
                    };
                    *guard = Some(tokens.clone());
                    tokens
                }
            }
        };
        self.persist(Some(&updated)).await;
    }

    pub async fn clear(&self) {
        *self.tokens.write().await = None;
        self.persist(None).await;
    }

    async fn persist(&self, tokens: Option<&SessionTokens>) {
        let Some(store) = &self.store else {
            return;
        };
        let store = store.lock().await;
        let result = match tokens {
            Some(tokens) => {
                store.save_session(&tokens.access, tokens.refresh.as_deref(), tokens.user_id)
            }
            None => store.clear_session(),
        };
        if let Err(err) = result {
            log::warn!("Failed to persist session: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(access: &str) -> SessionTokens {
        SessionTokens {
            access: access.to_string(),
            refresh: Some("r".to_string()),
            user_id: Some(4),
        }
    }

    #[tokio::test]
    async fn clones_share_tokens() {
        let session = Session::new();
        let other = session.clone();
        session.replace(tokens("a")).await;
        assert_eq!(other.access_token().await.as_deref(), Some("a"));
        assert_eq!(other.user_id().await, Some(4));
    }

    #[tokio::test]
    async fn update_access_keeps_refresh_token() {
        let session = Session::with_tokens(tokens("old"));
        session.update_access("new".to_string()).await;
        let current = session.tokens().await.unwrap();
        assert_eq!(current.access, "new");
        assert_eq!(current.refresh.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn store_round_trips_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");

        let session = Session::with_store(SessionDatabase::with_path(&path).unwrap()).unwrap();
        assert_eq!(session.tokens().await, None);
        session.replace(tokens("saved")).await;
        drop(session);

        let restored = Session::with_store(SessionDatabase::with_path(&path).unwrap()).unwrap();
        assert_eq!(restored.tokens().await, Some(tokens("saved")));

        restored.clear().await;
        let cleared = Session::with_store(SessionDatabase::with_path(&path).unwrap()).unwrap();
        assert_eq!(cleared.tokens().await, None);
    }
}
