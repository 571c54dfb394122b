#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("no session to authenticate the realtime channel")]
    NoSession,
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
    #[error("connection manager has been disposed")]
    Disposed,
}
