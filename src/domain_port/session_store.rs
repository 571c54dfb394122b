use crate::domain_model::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session store io error: {0}")]
    Io(String),
    #[error("session record is corrupt: {0}")]
    Serde(String),
}

/// Durable home of the single session record.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the persisted session, `None` when nobody is signed in.
    async fn load(&self) -> Result<Option<Session>, SessionStoreError>;
    /// Overwrite the persisted session.
    async fn save(&self, session: &Session) -> Result<(), SessionStoreError>;
    /// Remove the persisted session. Removing an absent record is not an error.
    async fn clear(&self) -> Result<(), SessionStoreError>;
}
