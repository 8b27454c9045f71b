//! One connected peer.
//!
//! A [`Session`] is shared (`Arc<Session>`) between the task reading the
//! peer's socket, the task writing to it, and every other connection that
//! wants to deliver a frame to it. All mutable state sits behind one short
//! `std::sync::Mutex`; nothing here ever awaits while holding it.
//!
//! # State machine
//!
//! ```text
//!   Unauthenticated ──→ Authenticating ──→ Authenticated
//!          │                  │                  │
//!          └──────────────────┴──────────────────┴──→ Closing ──→ Closed
//! ```
//!
//! States only move forward. `Authenticating` covers the short window in
//! which the identity has been verified and claimed in the registry but the
//! login reply has not been queued yet.
//!
//! # Outbound queue
//!
//! [`Session::enqueue`] never waits. The queue is bounded; when it is full
//! the oldest droppable frame (heartbeat traffic) makes room, and when no
//! such frame exists the session is closed with
//! [`ErrorCode::BackpressureOverflow`]. One stalled reader can never hold
//! up the sender.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hearth_protocol::{ErrorCode, Frame, UserId, UserSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::SessionError;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Process-unique identifier of a session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocates the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-connection limits and timeouts.
///
/// Durations serialize as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frames that may wait in one session's outbound queue.
    pub outbound_capacity: usize,

    /// Time allowed between accept and a successful login.
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,

    /// Time an authenticated session may stay silent before it is closed.
    /// Clients are expected to heartbeat well within this.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Failed logins tolerated on one connection.
    pub max_auth_failures: u32,

    /// Undecodable frames tolerated within `malformed_window`.
    pub malformed_limit: u32,

    #[serde(with = "duration_ms")]
    pub malformed_window: Duration,

    /// Time the writer gets to flush the final frames of a closing session.
    #[serde(with = "duration_ms")]
    pub flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            auth_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_auth_failures: 5,
            malformed_limit: 5,
            malformed_window: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(2),
        }
    }
}

/// Serde adapter: `Duration` as an integer number of milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// SessionState / CloseReason
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer hung up or the transport failed.
    PeerClosed,
    /// The peer sent `Logout`.
    Logout,
    /// Another login for the same user took over.
    Kicked(String),
    /// A connection-fatal error.
    Fatal { code: ErrorCode, message: String },
}

impl CloseReason {
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Fatal {
            code,
            message: message.into(),
        }
    }

    /// The last frame the peer should see, if any.
    pub fn final_frame(&self) -> Option<Frame> {
        match self {
            Self::PeerClosed | Self::Logout => None,
            Self::Kicked(reason) => Some(Frame::Kicked {
                reason: reason.clone(),
            }),
            Self::Fatal { code, message } => Some(Frame::error(*code, message.clone())),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Logout => f.write_str("logout"),
            Self::Kicked(reason) => write!(f, "kicked: {reason}"),
            Self::Fatal { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

/// What happened to a frame handed to [`Session::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued with room to spare.
    Queued,
    /// Queued after evicting the oldest droppable frame.
    QueuedAfterDrop,
    /// The queue was full and the frame itself was droppable, so it was
    /// discarded.
    Dropped,
    /// The queue was full of critical frames; the session is now closing.
    Overflow,
    /// The session was already closing; nothing was queued.
    Closed,
}

// ---------------------------------------------------------------------------
// SessionObserver
// ---------------------------------------------------------------------------

/// Something that holds references to sessions and must drop them when a
/// session closes.
///
/// Observers are called once, from whichever thread closed the session,
/// after the session's own lock has been released.
pub trait SessionObserver: Send + Sync {
    fn session_closed(&self, session: &Session);
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Inner {
    state: SessionState,
    user: Option<UserSummary>,
    version: Option<u16>,
    queue: VecDeque<Frame>,
    last_activity: Instant,
    auth_failures: u32,
    dropped_frames: u64,
    close_reason: Option<CloseReason>,
    observers: Vec<Weak<dyn SessionObserver>>,
}

/// Server-side state of one connected peer.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    capacity: usize,
    inner: Mutex<Inner>,
    wake_writer: Notify,
    closing: watch::Sender<bool>,
}

impl Session {
    /// Creates a session for a freshly accepted connection.
    pub fn new(peer: SocketAddr, config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            peer,
            capacity: config.outbound_capacity.max(1),
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                user: None,
                version: None,
                queue: VecDeque::new(),
                last_activity: Instant::now(),
                auth_failures: 0,
                dropped_frames: 0,
                close_reason: None,
                observers: Vec::new(),
            }),
            wake_writer: Notify::new(),
            closing: watch::Sender::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section below finishes its writes before any
        // operation that could panic, so a poisoned lock still guards
        // consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Returns `true` once `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.state().is_terminal()
    }

    /// The authenticated user, once known.
    pub fn user(&self) -> Option<UserSummary> {
        self.lock().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.lock().user.as_ref().map(|u| u.id)
    }

    /// Replaces the cached user profile (after a display-name change).
    pub fn set_user(&self, user: UserSummary) {
        let mut inner = self.lock();
        if inner.user.as_ref().is_some_and(|u| u.id == user.id) {
            inner.user = Some(user);
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason.clone()
    }

    // -- Handshake ---------------------------------------------------------

    /// Fixes the protocol version on first use.
    ///
    /// Returns `false` if a different version was already negotiated.
    pub fn negotiate_version(&self, version: u16) -> bool {
        let mut inner = self.lock();
        match inner.version {
            None => {
                inner.version = Some(version);
                true
            }
            Some(v) => v == version,
        }
    }

    pub fn version(&self) -> Option<u16> {
        self.lock().version
    }

    /// `Unauthenticated → Authenticating`, recording who the peer is.
    pub fn begin_authentication(&self, user: UserSummary) -> Result<(), SessionError> {
        let mut inner = self.lock();
        Self::advance(&mut inner, SessionState::Authenticating)?;
        inner.user = Some(user);
        Ok(())
    }

    /// `Authenticating → Authenticated`.
    pub fn complete_authentication(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        Self::advance(&mut inner, SessionState::Authenticated)?;
        inner.last_activity = Instant::now();
        Ok(())
    }

    fn advance(inner: &mut Inner, to: SessionState) -> Result<(), SessionError> {
        let from = inner.state;
        let allowed = match to {
            SessionState::Authenticating => from == SessionState::Unauthenticated,
            SessionState::Authenticated => from == SessionState::Authenticating,
            _ => false,
        };
        if !allowed {
            return Err(SessionError::InvalidTransition { from, to });
        }
        inner.state = to;
        Ok(())
    }

    /// Counts a failed login and returns the running total.
    pub fn record_auth_failure(&self) -> u32 {
        let mut inner = self.lock();
        inner.auth_failures += 1;
        inner.auth_failures
    }

    // -- Activity ----------------------------------------------------------

    /// Marks inbound traffic.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    // -- Outbound queue ----------------------------------------------------

    /// Queues a frame for the writer. Never waits.
    pub fn enqueue(&self, frame: Frame) -> EnqueueOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return EnqueueOutcome::Closed;
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(frame);
                EnqueueOutcome::Queued
            } else if let Some(pos) = inner.queue.iter().position(Frame::is_droppable) {
                inner.queue.remove(pos);
                inner.queue.push_back(frame);
                inner.dropped_frames += 1;
                EnqueueOutcome::QueuedAfterDrop
            } else if frame.is_droppable() {
                inner.dropped_frames += 1;
                EnqueueOutcome::Dropped
            } else {
                EnqueueOutcome::Overflow
            }
        };

        match outcome {
            EnqueueOutcome::Queued | EnqueueOutcome::QueuedAfterDrop => {
                self.wake_writer.notify_one();
            }
            EnqueueOutcome::Overflow => {
                tracing::warn!(
                    session_id = %self.id,
                    capacity = self.capacity,
                    "outbound queue full, closing slow session"
                );
                self.close(CloseReason::fatal(
                    ErrorCode::BackpressureOverflow,
                    "outbound queue overflow",
                ));
            }
            EnqueueOutcome::Dropped | EnqueueOutcome::Closed => {}
        }
        outcome
    }

    /// Number of frames waiting for the writer.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Frames discarded under backpressure so far.
    pub fn dropped_frames(&self) -> u64 {
        self.lock().dropped_frames
    }

    /// Takes everything currently queued, without waiting.
    pub fn drain_pending(&self) -> Vec<Frame> {
        self.lock().queue.drain(..).collect()
    }

    /// Waits for the next frame to write.
    ///
    /// Returns `None` once the session is closing and its queue is empty.
    /// Meant for a single writer task.
    pub async fn next_outbound(&self) -> Option<Frame> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.state.is_terminal() {
                    return None;
                }
            }
            self.wake_writer.notified().await;
        }
    }

    // -- Closing -----------------------------------------------------------

    /// Registers an observer to hear about this session closing.
    ///
    /// Returns `false` (and registers nothing) if the session is already
    /// closing.
    pub fn observe(&self, observer: Weak<dyn SessionObserver>) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.observers.push(observer);
        true
    }

    /// Starts closing the session. Idempotent.
    ///
    /// Queued droppable frames are discarded, the reason's final frame is
    /// queued regardless of capacity, observers are told to forget the
    /// session, and the writer is woken to flush what is left.
    pub fn close(&self, reason: CloseReason) {
        let observers = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Closing;
            inner.queue.retain(|f| !f.is_droppable());
            if let Some(frame) = reason.final_frame() {
                inner.queue.push_back(frame);
            }
            inner.close_reason = Some(reason.clone());
            std::mem::take(&mut inner.observers)
        };

        tracing::info!(session_id = %self.id, peer = %self.peer, %reason, "session closing");
        self.wake_writer.notify_one();
        self.closing.send_replace(true);

        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.session_closed(self);
        }
    }

    /// Resolves once the session has started closing, whoever closed it.
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Records that the writer has finished and the transport is gone.
    pub fn mark_closed(&self) {
        let observers = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            let was_open = !inner.state.is_terminal();
            inner.state = SessionState::Closed;
            inner.queue.clear();
            if was_open {
                inner.close_reason = Some(CloseReason::PeerClosed);
                std::mem::take(&mut inner.observers)
            } else {
                Vec::new()
            }
        };
        self.closing.send_replace(true);
        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.session_closed(self);
        }
        tracing::debug!(session_id = %self.id, "session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Tests
// =========================================================================
