use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra::MemorySessionStore;
use crate::logger::*;
use std::sync::Arc;
use tokio::sync::watch;

/// The one session of the running client.
///
/// Cheap to clone; every clone observes the same record. Injected at
/// bootstrap into the API client and the realtime manager, which follow
/// changes through [`SessionHandle::subscribe`].
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    current: watch::Sender<Option<Session>>,
    store: Arc<dyn SessionStore>,
}

impl SessionHandle {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner { current, store }),
        }
    }

    /// Ephemeral session, nothing survives the process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    /// Build the handle and load whatever the store persisted.
    pub async fn restore(store: Arc<dyn SessionStore>) -> Result<Self, SessionStoreError> {
        let handle = Self::new(store);
        if let Some(session) = handle.inner.store.load().await? {
            info!(principal = %session.principal.id, "restored persisted session");
            handle.inner.current.send_replace(Some(session));
        }
        Ok(handle)
    }

    pub fn current(&self) -> Option<Session> {
        self.inner.current.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|s| s.refresh_token.clone())
    }

    /// Follow every change of the session, including clearing.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.current.subscribe()
    }

    /// Install a session after a successful login.
    pub async fn establish(&self, session: Session) -> Result<(), SessionStoreError> {
        self.inner.current.send_replace(Some(session.clone()));
        self.inner.store.save(&session).await
    }

    /// Swap in rotated credentials, keeping the principal.
    ///
    /// Returns `Ok(false)` without touching anything when the session was
    /// cleared in the meantime.
    pub async fn replace_tokens(
        &self,
        access_token: AccessToken,
        refresh_token: RefreshToken,
    ) -> Result<bool, SessionStoreError> {
        let mut rotated = None;
        self.inner.current.send_if_modified(|current| match current {
            Some(session) => {
                *session = session.rotated(access_token, refresh_token);
                rotated = Some(session.clone());
                true
            }
            None => false,
        });

        match rotated {
            Some(session) => {
                self.inner.store.save(&session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the session. Returns whether there was one to drop, so callers
    /// racing on the same failure clear it exactly once.
    pub async fn clear(&self) -> bool {
        let mut had_session = false;
        self.inner.current.send_if_modified(|current| {
            had_session = current.take().is_some();
            had_session
        });

        if had_session {
            if let Err(e) = self.inner.store.clear().await {
                warn!(error = %e, "failed to remove persisted session");
            }
        }
        had_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(token: &str) -> Session {
        Session::new(
            AccessToken(token.into()),
            RefreshToken(format!("refresh-{token}")),
            Principal {
                id: "a-1".into(),
                name: "ops".into(),
                portal: PortalKind::Admin,
            },
        )
    }

    #[tokio::test]
    async fn restore_reads_the_store() {
        let store = Arc::new(MemorySessionStore::with_session(session("T1")));
        let handle = SessionHandle::restore(store).await.unwrap();
        assert_eq!(handle.access_token().unwrap().as_str(), "T1");
    }

    #[tokio::test]
    async fn replace_tokens_writes_through() {
        let store = Arc::new(MemorySessionStore::new());
        let handle = SessionHandle::new(store.clone());
        handle.establish(session("T1")).await.unwrap();

        let replaced = handle
            .replace_tokens(AccessToken("T2".into()), RefreshToken("R2".into()))
            .await
            .unwrap();
        assert!(replaced);
        assert_eq!(store.snapshot().unwrap().access_token.as_str(), "T2");
        assert_eq!(handle.current().unwrap().principal.name, "ops");
    }

    #[tokio::test]
    async fn replace_after_clear_is_ignored() {
        let handle = SessionHandle::in_memory();
        let replaced = handle
            .replace_tokens(AccessToken("T2".into()), RefreshToken("R2".into()))
            .await
            .unwrap();
        assert!(!replaced);
        assert!(!handle.is_signed_in());
    }

    #[tokio::test]
    async fn clear_reports_once() {
        let store = Arc::new(MemorySessionStore::new());
        let handle = SessionHandle::new(store.clone());
        handle.establish(session("T1")).await.unwrap();

        let mut changes = handle.subscribe();
        assert!(handle.clear().await);
        assert!(!handle.clear().await);
        assert!(store.snapshot().is_none());

        changes.changed().await.unwrap();
        assert!(changes.borrow_and_update().is_none());
    }
}
