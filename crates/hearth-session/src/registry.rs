//! The registry: who is connected, and who is online as whom.
//!
//! [`SessionRegistry`] is the single source of truth for presence. It holds
//! two maps behind one mutex:
//!
//! - every live session, authenticated or not, so shutdown can reach all of
//!   them;
//! - authenticated user → session, which enforces "at most one live session
//!   per user".
//!
//! The registry observes each session it tracks and forgets it the moment
//! the session starts closing. It never closes a session while holding its
//! own lock, because closing calls back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use hearth_protocol::UserId;
use serde::{Deserialize, Serialize};

use crate::{CloseReason, Session, SessionError, SessionId, SessionObserver};

/// Reason sent to a session displaced by a newer login.
pub const EVICTED_REASON: &str = "logged in from another connection";

/// What to do when a user who is already online logs in again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateLoginPolicy {
    /// Refuse the new login with `AlreadyConnected`; the old session stays.
    #[default]
    Reject,
    /// Kick the old session and let the new one take over.
    Evict,
}

/// Result of a successful [`SessionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    /// The user had no live session.
    Fresh,
    /// An older session for the user was kicked.
    Evicted(SessionId),
}

#[derive(Default)]
struct Maps {
    sessions: HashMap<SessionId, Arc<Session>>,
    users: HashMap<UserId, Arc<Session>>,
}

/// Process-wide table of live sessions.
pub struct SessionRegistry {
    policy: DuplicateLoginPolicy,
    maps: Mutex<Maps>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(policy: DuplicateLoginPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            policy,
            maps: Mutex::new(Maps::default()),
            this: this.clone(),
        })
    }

    pub fn policy(&self) -> DuplicateLoginPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a newly accepted session.
    ///
    /// Returns `false` if the session is already closing; it is then not
    /// tracked at all.
    pub fn insert(&self, session: &Arc<Session>) -> bool {
        let observer: Weak<dyn SessionObserver> = self.this.clone();
        let mut maps = self.lock();
        if !session.observe(observer) {
            return false;
        }
        maps.sessions.insert(session.id(), Arc::clone(session));
        true
    }

    /// Claims `user` for `session`, applying the duplicate-login policy.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyConnected`] under [`DuplicateLoginPolicy::Reject`]
    ///   when another live session holds the user.
    /// - [`SessionError::Closed`] if `session` is no longer tracked.
    pub fn register(
        &self,
        user: UserId,
        session: &Arc<Session>,
    ) -> Result<Registered, SessionError> {
        let evicted = {
            let mut maps = self.lock();
            if !maps.sessions.contains_key(&session.id()) {
                return Err(SessionError::Closed);
            }
            match maps.users.get(&user) {
                Some(current) if current.id() == session.id() => return Ok(Registered::Fresh),
                Some(_) if self.policy == DuplicateLoginPolicy::Reject => {
                    return Err(SessionError::AlreadyConnected(user));
                }
                _ => {}
            }
            maps.users.insert(user, Arc::clone(session))
        };

        // The old session is out of the map already; closing it outside the
        // lock lets its observers call back into `unregister`.
        match evicted {
            Some(old) => {
                tracing::info!(
                    %user,
                    old_session = %old.id(),
                    new_session = %session.id(),
                    "duplicate login, evicting older session"
                );
                old.close(CloseReason::Kicked(EVICTED_REASON.to_owned()));
                Ok(Registered::Evicted(old.id()))
            }
            None => {
                tracing::debug!(%user, session_id = %session.id(), "user registered");
                Ok(Registered::Fresh)
            }
        }
    }

    /// The live session for `user`, if any.
    pub fn lookup(&self, user: UserId) -> Option<Arc<Session>> {
        self.lock().users.get(&user).cloned()
    }

    /// Forgets a session. A user entry is removed only if it still points at
    /// this very session.
    pub fn unregister(&self, session: &Session) {
        let mut maps = self.lock();
        maps.sessions.remove(&session.id());
        if let Some(user) = session.user_id() {
            if maps
                .users
                .get(&user)
                .is_some_and(|current| current.id() == session.id())
            {
                maps.users.remove(&user);
            }
        }
    }

    /// Gives up a claim made by [`register`](Self::register) for a session
    /// that closed before its user was recorded on it.
    pub fn release(&self, user: UserId, id: SessionId) {
        let mut maps = self.lock();
        if maps.users.get(&user).is_some_and(|current| current.id() == id) {
            maps.users.remove(&user);
        }
    }

    /// Returns `true` if the session is tracked.
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    /// Returns `true` if `session` is the one registered for its user.
    pub fn is_current(&self, user: UserId, id: SessionId) -> bool {
        self.lock().users.get(&user).is_some_and(|s| s.id() == id)
    }

    /// Every authenticated session.
    pub fn online(&self) -> Vec<Arc<Session>> {
        self.lock().users.values().cloned().collect()
    }

    /// Number of tracked sessions, authenticated or not.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.lock().users.len()
    }

    /// Closes every tracked session.
    pub fn close_all(&self, reason: &CloseReason) {
        let sessions: Vec<_> = self.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.close(reason.clone());
        }
    }
}

impl SessionObserver for SessionRegistry {
    fn session_closed(&self, session: &Session) {
        self.unregister(session);
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SessionConfig, SessionState};
    use hearth_protocol::{ErrorCode, Frame, UserSummary};

    fn new_session() -> Arc<Session> {
        Session::new("127.0.0.1:5000".parse().unwrap(), &SessionConfig::default())
    }

    /// Inserts and logs a session in as `user`, the way the router does.
    fn login(
        registry: &SessionRegistry,
        user: u64,
    ) -> (Arc<Session>, Result<Registered, SessionError>) {
        let session = new_session();
        assert!(registry.insert(&session));
        let result = registry.register(UserId(user), &session);
        if result.is_ok() {
            session
                .begin_authentication(UserSummary {
                    id: UserId(user),
                    display_name: format!("u{user}"),
                })
                .unwrap();
            session.complete_authentication().unwrap();
        }
        (session, result)
    }

    // =====================================================================
    // insert() / unregister()
    // =====================================================================

    #[test]
    fn test_insert_tracks_unauthenticated_session() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let session = new_session();
        assert!(registry.insert(&session));
        assert!(registry.contains(session.id()));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_insert_closing_session_is_refused() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let session = new_session();
        session.close(CloseReason::PeerClosed);
        assert!(!registry.insert(&session));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_before_login_leaves_no_entry() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let session = new_session();
        registry.insert(&session);

        session.close(CloseReason::PeerClosed);

        assert!(registry.is_empty());
        assert!(matches!(
            registry.register(UserId(1), &session),
            Err(SessionError::Closed)
        ));
        assert!(registry.lookup(UserId(1)).is_none());
    }

    #[test]
    fn test_release_after_close_mid_login_frees_user() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let session = new_session();
        registry.insert(&session);
        registry.register(UserId(1), &session).unwrap();

        // Closed before the user was recorded on the session.
        session.close(CloseReason::PeerClosed);
        assert!(registry.lookup(UserId(1)).is_some());

        registry.release(UserId(1), session.id());
        assert!(registry.lookup(UserId(1)).is_none());
    }

    #[test]
    fn test_release_ignores_other_session() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (current, _) = login(&registry, 1);
        let other = new_session();

        registry.release(UserId(1), other.id());

        assert_eq!(registry.lookup(UserId(1)).unwrap().id(), current.id());
    }

    #[test]
    fn test_close_after_login_removes_user_entry() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (session, result) = login(&registry, 1);
        result.unwrap();
        assert!(registry.lookup(UserId(1)).is_some());

        session.close(CloseReason::Logout);

        assert!(registry.lookup(UserId(1)).is_none());
        assert!(registry.is_empty());
    }

    // =====================================================================
    // register(): Reject
    // =====================================================================

    #[test]
    fn test_register_reject_second_login_returns_already_connected() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (first, _) = login(&registry, 1);
        let (second, result) = login(&registry, 1);

        assert!(matches!(result, Err(SessionError::AlreadyConnected(UserId(1)))));
        assert_eq!(registry.lookup(UserId(1)).unwrap().id(), first.id());
        assert!(first.is_authenticated());
        assert_eq!(second.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_register_reject_allows_login_after_old_session_closes() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (first, _) = login(&registry, 1);
        first.close(CloseReason::PeerClosed);

        let (second, result) = login(&registry, 1);
        assert_eq!(result.unwrap(), Registered::Fresh);
        assert_eq!(registry.lookup(UserId(1)).unwrap().id(), second.id());
    }

    #[test]
    fn test_register_same_session_twice_is_noop() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (session, _) = login(&registry, 1);
        assert_eq!(
            registry.register(UserId(1), &session).unwrap(),
            Registered::Fresh
        );
        assert_eq!(registry.online_count(), 1);
    }

    // =====================================================================
    // register(): Evict
    // =====================================================================

    #[test]
    fn test_register_evict_kicks_old_session() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Evict);
        let (first, _) = login(&registry, 1);
        let (second, result) = login(&registry, 1);

        assert_eq!(result.unwrap(), Registered::Evicted(first.id()));
        assert_eq!(first.state(), SessionState::Closing);
        assert_eq!(
            first.drain_pending(),
            vec![Frame::Kicked {
                reason: EVICTED_REASON.into()
            }]
        );
        assert_eq!(registry.lookup(UserId(1)).unwrap().id(), second.id());
        assert!(!registry.contains(first.id()));
    }

    #[test]
    fn test_register_evict_old_close_does_not_remove_new_entry() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Evict);
        let (first, _) = login(&registry, 1);
        let (second, _) = login(&registry, 1);

        // The evicted session finishing its shutdown must not take the
        // new session's registration with it.
        first.mark_closed();
        registry.unregister(&first);

        assert_eq!(registry.lookup(UserId(1)).unwrap().id(), second.id());
        assert_eq!(registry.online_count(), 1);
    }

    // =====================================================================
    // Queries
    // =====================================================================

    #[test]
    fn test_online_lists_only_authenticated_sessions() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        login(&registry, 1);
        login(&registry, 2);
        registry.insert(&new_session());

        let mut online: Vec<_> = registry
            .online()
            .iter()
            .filter_map(|s| s.user_id())
            .collect();
        online.sort();
        assert_eq!(online, vec![UserId(1), UserId(2)]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_is_current_distinguishes_sessions() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Evict);
        let (first, _) = login(&registry, 1);
        assert!(registry.is_current(UserId(1), first.id()));
        let (second, _) = login(&registry, 1);
        assert!(!registry.is_current(UserId(1), first.id()));
        assert!(registry.is_current(UserId(1), second.id()));
    }

    #[test]
    fn test_close_all_closes_everything_with_reason() {
        let registry = SessionRegistry::new(DuplicateLoginPolicy::Reject);
        let (a, _) = login(&registry, 1);
        let b = new_session();
        registry.insert(&b);

        registry.close_all(&CloseReason::fatal(ErrorCode::ShuttingDown, "bye"));

        assert!(a.is_closing());
        assert!(b.is_closing());
        assert!(registry.is_empty());
        assert_eq!(registry.online_count(), 0);
    }
}
