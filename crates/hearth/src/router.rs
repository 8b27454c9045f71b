//! The protocol state machine.
//!
//! [`Router::dispatch`] takes one inbound frame from one session and decides
//! what it means given the session's state:
//!
//! | State             | Accepted frames                                        |
//! |-------------------|--------------------------------------------------------|
//! | `Unauthenticated` | `Register`, `Login`                                    |
//! | `Authenticated`   | channel requests, `History`, `MessageSend`,            |
//! |                   | `ImageSend`, `SetDisplayName`, `Heartbeat`, `Logout`   |
//! | anything else     | nothing                                                |
//!
//! A frame the state does not accept is a protocol error and ends the
//! connection. Everything else that goes wrong (a missing channel, a
//! refused login, a failed write) is answered in-band to the sender only.
//!
//! The router never writes to a socket. It enqueues frames on sessions and
//! returns a [`Flow`] telling the connection task whether to keep reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hearth_channel::{ChannelDirectory, ChannelError};
use hearth_protocol::{
    ChannelId, ErrorCode, Frame, FrameCodec, Image, MessageId, MessageRecord, UserId, UserSummary,
};
use hearth_session::{
    CloseReason, Registered, Session, SessionError, SessionRegistry, SessionState,
};
use hearth_store::{Store, UserRecord, blocking};

use crate::auth::{Accounts, normalize_display_name};
use crate::config::ServerConfig;

/// Page size of a `History` request that names none.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Largest page a `History` request can ask for.
pub const MAX_HISTORY_LIMIT: u32 = 100;

/// Longest message body or image caption, in characters, after trimming.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// What the connection should do after a frame was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

/// Interprets inbound frames and mutates shared state.
pub struct Router {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    directory: Arc<ChannelDirectory>,
    accounts: Accounts,
    codec: Arc<FrameCodec>,
    max_auth_failures: u32,
    shutting_down: AtomicBool,
}

impl Router {
    /// Builds the registry, channel directory and frame codec `config`
    /// describes, over an opened store.
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Arc<Self> {
        let registry = SessionRegistry::new(config.duplicate_login);
        let directory = ChannelDirectory::new(Arc::clone(&store), Arc::clone(&registry));
        let codec = FrameCodec::default().with_max_frame_size(config.max_frame_size);
        Arc::new(Self {
            accounts: Accounts::new(Arc::clone(&store), config.password_cost),
            store,
            registry,
            directory,
            codec: Arc::new(codec),
            max_auth_failures: config.session.max_auth_failures.max(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The codec connections frame with. Replies are sized against its
    /// limit.
    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.codec
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    // -- Shutdown ----------------------------------------------------------

    /// Stops accepting frames and closes every session.
    ///
    /// Frames already being dispatched run to completion; anything after
    /// them is refused with `ShuttingDown`.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(sessions = self.registry.len(), "closing all sessions");
        self.registry.close_all(&shutdown_reason());
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // -- Dispatch ----------------------------------------------------------

    /// Handles one inbound frame from `session`.
    pub async fn dispatch(&self, session: &Arc<Session>, frame: Frame) -> Flow {
        if self.is_shutting_down() {
            return Flow::Close(shutdown_reason());
        }

        let state = session.state();
        tracing::debug!(
            session_id = %session.id(),
            ?state,
            frame = frame.frame_type().name(),
            "dispatching frame"
        );

        match state {
            SessionState::Unauthenticated => self.unauthenticated(session, frame).await,
            SessionState::Authenticated => match session.user() {
                Some(user) => self.authenticated(session, user, frame).await,
                None => out_of_state(state, &frame),
            },
            SessionState::Authenticating | SessionState::Closing | SessionState::Closed => {
                out_of_state(state, &frame)
            }
        }
    }

    async fn unauthenticated(&self, session: &Arc<Session>, frame: Frame) -> Flow {
        let result = match &frame {
            Frame::Register { username, password } => {
                self.accounts.register(username, password).await
            }
            Frame::Login { username, password } => self.accounts.login(username, password).await,
            _ => return out_of_state(SessionState::Unauthenticated, &frame),
        };

        match result {
            Ok(user) => self.admit(session, user),
            Err(failure) if !failure.is_peer_fault() => {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %failure,
                    "login failed in store"
                );
                session.enqueue(Frame::error(
                    ErrorCode::PersistenceFailure,
                    "login could not be checked, try again",
                ));
                Flow::Continue
            }
            Err(failure) => {
                session.enqueue(Frame::AuthError {
                    reason: failure.to_string(),
                });
                let failures = session.record_auth_failure();
                tracing::debug!(session_id = %session.id(), failures, %failure, "login refused");
                if failures >= self.max_auth_failures {
                    Flow::Close(CloseReason::fatal(
                        ErrorCode::ProtocolAbuse,
                        "too many failed logins",
                    ))
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Moves a session whose credentials checked out to `Authenticated`.
    ///
    /// The user is claimed in the registry first, so a refused duplicate
    /// login leaves the session untouched in `Unauthenticated`.
    fn admit(&self, session: &Arc<Session>, user: UserRecord) -> Flow {
        match self.registry.register(user.id, session) {
            Ok(Registered::Fresh) => {}
            Ok(Registered::Evicted(old)) => {
                tracing::info!(user_id = %user.id, evicted = %old, "took over from older session");
            }
            Err(SessionError::AlreadyConnected(id)) => {
                session.enqueue(Frame::error(
                    ErrorCode::AlreadyConnected,
                    format!("user {id} is already connected"),
                ));
                return Flow::Continue;
            }
            Err(e) => {
                tracing::debug!(session_id = %session.id(), error = %e, "session gone mid-login");
                return Flow::Close(CloseReason::PeerClosed);
            }
        }

        let summary = user.summary();
        if session.begin_authentication(summary.clone()).is_err() {
            self.registry.release(user.id, session.id());
            return Flow::Close(CloseReason::PeerClosed);
        }

        let others = self.others_online(session);
        session.enqueue(Frame::AuthOk {
            user: summary.clone(),
            online: others.iter().filter_map(|s| s.user()).collect(),
        });
        if session.complete_authentication().is_err() {
            return Flow::Close(CloseReason::PeerClosed);
        }
        self.directory.user_online(session);

        tracing::info!(
            session_id = %session.id(),
            user_id = %user.id,
            username = %user.username,
            "user authenticated"
        );

        for other in others {
            other.enqueue(Frame::UserConnected {
                user: summary.clone(),
            });
        }
        Flow::Continue
    }

    async fn authenticated(&self, session: &Arc<Session>, user: UserSummary, frame: Frame) -> Flow {
        let result = match frame {
            Frame::ChannelCreate { name } => self
                .directory
                .create(user.id, &name)
                .await
                .map(|channel| Frame::ChannelCreated { channel }),
            Frame::ChannelJoin { channel_id } => self
                .directory
                .join(user.id, channel_id)
                .await
                .map(|channel| Frame::ChannelJoined { channel }),
            Frame::ChannelLeave { channel_id } => self
                .directory
                .leave(user.id, channel_id)
                .await
                .map(|()| Frame::ChannelLeft { channel_id }),
            Frame::ChannelList {} => self
                .directory
                .list()
                .await
                .map(|channels| Frame::Channels { channels }),
            Frame::History {
                channel_id,
                before,
                limit,
            } => self.history(user.id, channel_id, before, limit).await,
            Frame::MessageSend { channel_id, body } => {
                self.send_message(session, user.id, channel_id, &body).await;
                return Flow::Continue;
            }
            Frame::ImageSend {
                channel_id,
                caption,
                image,
            } => {
                self.send_image(session, user.id, channel_id, &caption, image)
                    .await;
                return Flow::Continue;
            }
            Frame::SetDisplayName { display_name } => {
                self.set_display_name(session, user.id, &display_name).await;
                return Flow::Continue;
            }
            Frame::Heartbeat { client_time } => Ok(Frame::HeartbeatAck {
                client_time,
                server_time: now_millis(),
            }),
            Frame::Logout {} => {
                tracing::info!(session_id = %session.id(), user_id = %user.id, "logout");
                return Flow::Close(CloseReason::Logout);
            }
            other => return out_of_state(SessionState::Authenticated, &other),
        };

        match result {
            Ok(reply) => {
                session.enqueue(reply);
            }
            Err(e) => reply_channel_error(session, &e),
        }
        Flow::Continue
    }

    async fn history(
        &self,
        user: UserId,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<Frame, ChannelError> {
        self.directory.ensure_member(user, channel).await?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let messages = blocking(&self.store, move |s| s.history(channel, before, limit)).await?;
        Ok(self.history_page(channel, messages))
    }

    /// Keeps the newest messages that fit in one frame. The client pages
    /// past the rest with `before`.
    fn history_page(&self, channel: ChannelId, mut messages: Vec<MessageRecord>) -> Frame {
        let empty = Frame::HistoryPage {
            channel_id: channel,
            messages: Vec::new(),
        };
        let overhead = self.codec.body_len(&empty).unwrap_or(usize::MAX);
        let mut budget = self.codec.max_frame_size().saturating_sub(overhead);

        let mut fitting = 0;
        for (i, message) in messages.iter().enumerate() {
            // One comma between elements.
            let cost = self
                .codec
                .value_len(message)
                .map_or(usize::MAX, |len| len.saturating_add(usize::from(i > 0)));
            if cost > budget {
                break;
            }
            budget -= cost;
            fitting += 1;
        }

        if fitting < messages.len() {
            tracing::debug!(
                channel_id = %channel,
                requested = messages.len(),
                fitting,
                "history page cut to the frame size limit"
            );
            if fitting == 0 {
                // Only reachable when the limit shrank after the message was
                // stored: every append is checked against it.
                return Frame::error(
                    ErrorCode::TooLarge,
                    format!(
                        "message {} in {channel} is larger than the frame size limit",
                        messages[0].id
                    ),
                );
            }
            messages.truncate(fitting);
        }
        Frame::HistoryPage {
            channel_id: channel,
            messages,
        }
    }

    async fn send_message(
        &self,
        session: &Arc<Session>,
        author: UserId,
        channel: ChannelId,
        body: &str,
    ) {
        let body = body.trim();
        let len = body.chars().count();
        if len == 0 || len > MAX_MESSAGE_LEN {
            session.enqueue(Frame::error(
                ErrorCode::InvalidInput,
                format!("message bodies are 1 to {MAX_MESSAGE_LEN} characters"),
            ));
            return;
        }
        self.publish(session, author, channel, body.to_owned(), None)
            .await;
    }

    async fn send_image(
        &self,
        session: &Arc<Session>,
        author: UserId,
        channel: ChannelId,
        caption: &str,
        image: Image,
    ) {
        let caption = caption.trim();
        if caption.chars().count() > MAX_MESSAGE_LEN {
            session.enqueue(Frame::error(
                ErrorCode::InvalidInput,
                format!("captions are at most {MAX_MESSAGE_LEN} characters"),
            ));
            return;
        }
        if image.width == 0 || image.height == 0 || image.data.is_empty() {
            session.enqueue(Frame::error(
                ErrorCode::InvalidInput,
                "images need a non-zero size and data",
            ));
            return;
        }
        self.publish(session, author, channel, caption.to_owned(), Some(image))
            .await;
    }

    /// Persists a message and fans it out to the channel's online members.
    ///
    /// The sender is one of them; its copy of the broadcast is the
    /// confirmation. Nothing is broadcast unless the append succeeded.
    async fn publish(
        &self,
        session: &Arc<Session>,
        author: UserId,
        channel: ChannelId,
        body: String,
        image: Option<Image>,
    ) {
        if let Err(e) = self.directory.ensure_member(author, channel).await {
            reply_channel_error(session, &e);
            return;
        }

        if !self.deliverable(channel, author, &body, image.as_ref()) {
            session.enqueue(Frame::error(
                ErrorCode::TooLarge,
                format!(
                    "message does not fit in a {} byte frame",
                    self.codec.max_frame_size()
                ),
            ));
            return;
        }

        // Held until every recipient has the broadcast queued, so queue order
        // within the channel matches id order.
        let _order = self.directory.sequencer(channel).await;

        let appended = blocking(&self.store, move |s| {
            s.append_message(channel, author, &body, image.as_ref())
        })
        .await;
        let message = match appended {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%author, channel_id = %channel, error = %e, "message append failed");
                session.enqueue(Frame::error(
                    ErrorCode::PersistenceFailure,
                    "message was not stored",
                ));
                return;
            }
        };

        let recipients = match self.directory.members_online(channel).await {
            Ok(recipients) => recipients,
            Err(e) => {
                tracing::warn!(
                    channel_id = %channel,
                    error = %e,
                    "online members unavailable, confirming to sender only"
                );
                vec![Arc::clone(session)]
            }
        };

        tracing::debug!(
            channel_id = %channel,
            message_id = %message.id,
            recipients = recipients.len(),
            "broadcasting message"
        );
        for recipient in &recipients {
            recipient.enqueue(Frame::MessageBroadcast {
                message: message.clone(),
            });
        }
    }

    /// Whether a message with this content, once stored, can be broadcast
    /// and later returned by `History`. Checked with the largest id and
    /// timestamp it could be given.
    fn deliverable(
        &self,
        channel: ChannelId,
        author: UserId,
        body: &str,
        image: Option<&Image>,
    ) -> bool {
        let largest = MessageRecord {
            id: MessageId(u64::MAX),
            channel_id: channel,
            author,
            body: body.to_owned(),
            image: image.cloned(),
            timestamp: i64::MAX,
        };
        let page = Frame::HistoryPage {
            channel_id: channel,
            messages: vec![largest.clone()],
        };
        self.codec.fits(&page) && self.codec.fits(&Frame::MessageBroadcast { message: largest })
    }

    async fn set_display_name(&self, session: &Arc<Session>, user: UserId, requested: &str) {
        let Some(name) = normalize_display_name(requested) else {
            session.enqueue(Frame::error(
                ErrorCode::InvalidInput,
                format!(
                    "display names are 1 to {} characters",
                    crate::auth::MAX_DISPLAY_NAME_LEN
                ),
            ));
            return;
        };

        let name = name.to_owned();
        let updated = blocking(&self.store, move |s| s.update_display_name(user, &name)).await;
        let updated = match updated {
            Ok(record) => record.summary(),
            Err(e) => {
                tracing::warn!(%user, error = %e, "display name update failed");
                session.enqueue(Frame::error(
                    ErrorCode::PersistenceFailure,
                    "display name was not stored",
                ));
                return;
            }
        };

        session.set_user(updated.clone());
        session.enqueue(Frame::ProfileUpdated {
            user: updated.clone(),
        });
        for other in self.others_online(session) {
            other.enqueue(Frame::ProfileUpdated {
                user: updated.clone(),
            });
        }
    }

    // -- Presence ----------------------------------------------------------

    fn others_online(&self, session: &Session) -> Vec<Arc<Session>> {
        self.registry
            .online()
            .into_iter()
            .filter(|s| s.id() != session.id() && s.is_authenticated())
            .collect()
    }

    /// Announces that `session`'s user went offline.
    ///
    /// Called once per connection after the session started closing. Nothing
    /// is sent if the user never logged in or another session (a newer
    /// login) still holds them.
    pub fn session_ended(&self, session: &Session) {
        let Some(user_id) = session.user_id() else {
            return;
        };
        if self.registry.lookup(user_id).is_some() {
            return;
        }
        tracing::info!(session_id = %session.id(), %user_id, "user disconnected");
        for other in self.others_online(session) {
            other.enqueue(Frame::UserDisconnected { user_id });
        }
    }
}

fn shutdown_reason() -> CloseReason {
    CloseReason::fatal(ErrorCode::ShuttingDown, "server is shutting down")
}

fn out_of_state(state: SessionState, frame: &Frame) -> Flow {
    tracing::debug!(?state, frame = frame.frame_type().name(), "frame not valid in state");
    Flow::Close(CloseReason::fatal(
        ErrorCode::ProtocolError,
        format!("{} is not valid while {state:?}", frame.frame_type().name()),
    ))
}

fn reply_channel_error(session: &Session, err: &ChannelError) {
    if matches!(err, ChannelError::Store(_)) {
        tracing::warn!(
            session_id = %session.id(),
            error = %err,
            "channel operation failed in store"
        );
    }
    session.enqueue(Frame::error(err.code(), err.to_string()));
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

// =========================================================================
// Tests
// =========================================================================
