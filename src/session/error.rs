//! Error types for connection session management.

use super::{Role, SessionId};

/// Indicates that no live session is registered under the given id.
#[derive(Debug, thiserror::Error)]
#[error("no live session {session_id}")]
pub struct SessionNotFound {
    pub session_id: SessionId,
}

/// Indicates that an envelope could not be queued for a session.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    SessionNotFound(#[from] SessionNotFound),

    /// The session's outbound queue is full; the envelope was dropped.
    #[error("outbound queue for session {session_id} is full")]
    Full { session_id: SessionId },

    /// The session is registered but its writer has already shut down.
    #[error("connection for session {session_id} is closed")]
    ConnectionClosed { session_id: SessionId },
}

/// Indicates that an envelope declared a role or identity other than the one its session is
/// bound to.
#[derive(Debug, thiserror::Error)]
#[error(
    "session is already bound as {role} {}",
    .associated_id.as_deref().unwrap_or("without an id")
)]
pub struct BindingConflict {
    pub role: Role,
    pub associated_id: Option<String>,
}
