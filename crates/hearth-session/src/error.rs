//! Error types for the session layer.

use hearth_protocol::UserId;

use crate::SessionState;

/// Errors that can occur while managing sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested state change would move a session backwards, or skip
    /// a step.
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// The user already has a live session and the registry is configured
    /// to refuse a second one.
    #[error("user {0} already has a live session")]
    AlreadyConnected(UserId),

    /// The session closed before the operation could take effect.
    #[error("session is closed")]
    Closed,
}
