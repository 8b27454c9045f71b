//! Per-connection handler: framing, timeouts, and the writer task.
//!
//! Each accepted connection gets its own Tokio task running
//! [`handle_connection`]. The flow is:
//!   1. Create a [`Session`] and track it in the registry
//!   2. Split the connection; spawn a writer task that drains the session's
//!      outbound queue onto the wire
//!   3. Read: bytes → frames → [`Router::dispatch`], one frame at a time
//!   4. When either side ends the session, give the writer `flush_timeout`
//!      to deliver what is left, then drop the transport

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use hearth_protocol::{ErrorCode, Frame, FrameCodec};
use hearth_session::{CloseReason, Session, SessionConfig};
use hearth_transport::{Connection, ConnectionReader, ConnectionWriter};
use tokio::time::Instant;

use crate::HearthError;
use crate::router::{Flow, Router};

/// Drop guard that ends a session when the handler exits.
///
/// Runs on every exit path, including a panic inside dispatch, so the
/// registry and channel directory never keep a dead session and the user's
/// departure is always announced. Closing is synchronous, so no task needs
/// to be spawned here.
struct SessionGuard {
    session: Arc<Session>,
    router: Arc<Router>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close(CloseReason::PeerClosed);
        self.router.session_ended(&self.session);
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C: Connection>(
    conn: C,
    router: Arc<Router>,
    codec: Arc<FrameCodec>,
    config: Arc<SessionConfig>,
) -> Result<(), HearthError> {
    let conn_id = conn.id();
    let session = Session::new(conn.peer_addr(), &config);
    tracing::debug!(
        %conn_id,
        session_id = %session.id(),
        peer = %session.peer(),
        "handling new connection"
    );

    if !router.registry().insert(&session) {
        return Ok(());
    }
    let guard = SessionGuard {
        session: Arc::clone(&session),
        router: Arc::clone(&router),
    };
    if router.is_shutting_down() {
        session.close(CloseReason::fatal(ErrorCode::ShuttingDown, "server is shutting down"));
    }

    let (mut reader, writer) = conn.split();
    let mut writer_task = tokio::spawn(write_loop(
        writer,
        Arc::clone(&session),
        Arc::clone(&codec),
    ));

    let result = read_loop(&mut reader, &session, &router, &codec, &config).await;

    // Closes the session (if the peer went first) and announces the
    // departure before the flush, which may take a while.
    drop(guard);

    if tokio::time::timeout(config.flush_timeout, &mut writer_task)
        .await
        .is_err()
    {
        tracing::warn!(
            session_id = %session.id(),
            pending = session.pending(),
            "peer did not take final frames in time, dropping connection"
        );
        writer_task.abort();
        session.mark_closed();
    }

    tracing::debug!(%conn_id, session_id = %session.id(), "connection finished");
    result
}

/// Reads until the peer hangs up or the session starts closing.
async fn read_loop<R: ConnectionReader>(
    reader: &mut R,
    session: &Arc<Session>,
    router: &Router,
    codec: &FrameCodec,
    config: &SessionConfig,
) -> Result<(), HearthError> {
    let accepted_at = Instant::now();
    let mut buf = BytesMut::new();
    let mut malformed = MalformedWindow::new(config.malformed_limit, config.malformed_window);

    loop {
        let authenticated = session.is_authenticated();
        let deadline = if authenticated {
            Instant::now() + config.idle_timeout.saturating_sub(session.idle_for())
        } else {
            accepted_at + config.auth_timeout
        };

        let chunk = tokio::select! {
            () = session.closed() => return Ok(()),
            () = tokio::time::sleep_until(deadline) => {
                if authenticated && session.idle_for() < config.idle_timeout {
                    continue;
                }
                let reason = if authenticated {
                    CloseReason::fatal(ErrorCode::IdleTimeout, "no traffic within the idle timeout")
                } else {
                    CloseReason::fatal(ErrorCode::AuthTimeout, "login not completed in time")
                };
                tracing::warn!(session_id = %session.id(), %reason, "closing silent connection");
                session.close(reason);
                return Ok(());
            }
            received = reader.recv() => received?,
        };

        let Some(chunk) = chunk else {
            tracing::debug!(session_id = %session.id(), "peer closed connection");
            return Ok(());
        };
        buf.extend_from_slice(&chunk);

        loop {
            match codec.decode(&mut buf) {
                Ok(None) => break,
                Ok(Some(envelope)) => {
                    session.touch();
                    if !session.negotiate_version(envelope.version) {
                        session.close(CloseReason::fatal(
                            ErrorCode::ProtocolError,
                            "protocol version changed mid-connection",
                        ));
                        return Ok(());
                    }
                    if let Flow::Close(reason) = router.dispatch(session, envelope.frame).await {
                        session.close(reason);
                        return Ok(());
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %e,
                        "unrecoverable framing error"
                    );
                    session.close(CloseReason::fatal(ErrorCode::ProtocolError, e.to_string()));
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        error = %e,
                        "skipping malformed frame"
                    );
                    if malformed.record(Instant::now()) {
                        tracing::warn!(session_id = %session.id(), "malformed frame rate exceeded");
                        session.close(CloseReason::fatal(
                            ErrorCode::ProtocolAbuse,
                            "too many malformed frames",
                        ));
                        return Ok(());
                    }
                    session.enqueue(Frame::error(ErrorCode::ProtocolError, e.to_string()));
                }
            }
        }
    }
}

/// Drains the session's outbound queue onto the wire.
///
/// Ends when the session is closing and its queue is empty, or when a send
/// fails. A frame that cannot be encoded is skipped if it is droppable and
/// otherwise replaced by a `TooLarge` error, so the peer always learns that
/// a reply went missing.
async fn write_loop<W: ConnectionWriter>(
    mut writer: W,
    session: Arc<Session>,
    codec: Arc<FrameCodec>,
) {
    while let Some(frame) = session.next_outbound().await {
        let bytes = match codec.encode_to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id(),
                    frame = frame.frame_type().name(),
                    error = %e,
                    "frame cannot be encoded"
                );
                match undeliverable(&codec, &frame) {
                    Some(bytes) => bytes,
                    None => continue,
                }
            }
        };
        if let Err(e) = writer.send(&bytes).await {
            tracing::debug!(session_id = %session.id(), error = %e, "send failed");
            session.close(CloseReason::PeerClosed);
            break;
        }
    }

    if let Err(e) = writer.close().await {
        tracing::debug!(session_id = %session.id(), error = %e, "close failed");
    }
    session.mark_closed();
}

/// The error sent in place of a frame that failed to encode, or `None` if
/// the frame may be dropped.
fn undeliverable(codec: &FrameCodec, frame: &Frame) -> Option<Vec<u8>> {
    if frame.is_droppable() {
        return None;
    }
    let notice = Frame::error(
        ErrorCode::TooLarge,
        format!(
            "{} could not be delivered within the {} byte frame limit",
            frame.frame_type().name(),
            codec.max_frame_size()
        ),
    );
    codec.encode_to_vec(&notice).ok()
}

/// Sliding-window counter of malformed frames.
struct MalformedWindow {
    limit: u32,
    window: Duration,
    seen: VecDeque<Instant>,
}

impl MalformedWindow {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            seen: VecDeque::new(),
        }
    }

    /// Records one malformed frame. Returns `true` once more than `limit`
    /// fall within the window.
    fn record(&mut self, now: Instant) -> bool {
        while self
            .seen
            .front()
            .is_some_and(|&at| now.duration_since(at) > self.window)
        {
            self.seen.pop_front();
        }
        self.seen.push_back(now);
        self.seen.len() > self.limit as usize
    }
}
