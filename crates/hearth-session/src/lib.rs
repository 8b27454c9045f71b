//! Session management for hearth.
//!
//! This crate tracks the lifecycle of every connected peer:
//!
//! 1. **Sessions** ([`Session`]): one per accepted connection, with its
//!    authentication state, cached user profile, and bounded outbound queue.
//! 2. **Registry** ([`SessionRegistry`]): every live session, plus the map
//!    from user to session that decides who is online.
//!
//! # How it fits in the stack
//!
//! ```text
//! Router (above)        ← enqueues frames, drives logins
//!     ↕
//! Session layer (this)  ← peer identity, queues, presence
//!     ↕
//! Protocol (below)      ← Frame, UserId, ErrorCode
//! ```
//!
//! Anything else that keeps references to sessions (the channel directory's
//! online sets) implements [`SessionObserver`] so a closing session is
//! pruned everywhere at once.

mod error;
mod registry;
mod session;

pub use error::SessionError;
pub use registry::{DuplicateLoginPolicy, EVICTED_REASON, Registered, SessionRegistry};
pub use session::{
    CloseReason, EnqueueOutcome, Session, SessionConfig, SessionId, SessionObserver,
    SessionState, duration_ms,
};
