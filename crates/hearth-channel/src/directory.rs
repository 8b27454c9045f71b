//! The channel directory: who belongs where, and who is listening.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use hearth_protocol::{ChannelId, ChannelInfo, UserId};
use hearth_session::{Session, SessionObserver, SessionRegistry};
use hearth_store::{Store, blocking};
use tokio::sync::OwnedMutexGuard;

use crate::{ChannelError, is_valid_name};

#[derive(Default)]
struct Cache {
    /// Durable membership, loaded lazily and written through on change.
    members: HashMap<ChannelId, HashSet<UserId>>,
    /// Members' live sessions. Derived from `members` and the registry;
    /// dropped and rebuilt whenever it may be stale.
    online: HashMap<ChannelId, Vec<Arc<Session>>>,
    /// Bumped by every change that invalidates an entry. A snapshot read
    /// across an `.await` is only cached if this did not move meanwhile.
    generation: u64,
}

impl Cache {
    fn invalidate(&mut self, channel: ChannelId) {
        self.online.remove(&channel);
        self.generation += 1;
    }
}

/// Channel metadata, membership, and online sets.
///
/// Durable membership in the store is authoritative: joins and leaves are
/// written there before they are acknowledged. The in-memory sets only
/// speed up fan-out and are always reconcilable against the store and the
/// [`SessionRegistry`].
pub struct ChannelDirectory {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    cache: Mutex<Cache>,
    sequencers: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
    this: Weak<ChannelDirectory>,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn Store>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            registry,
            cache: Mutex::new(Cache::default()),
            sequencers: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Channels ----------------------------------------------------------

    /// Creates a channel owned (and joined) by `owner`.
    pub async fn create(&self, owner: UserId, name: &str) -> Result<ChannelInfo, ChannelError> {
        if !is_valid_name(name) {
            return Err(ChannelError::InvalidName(name.to_owned()));
        }
        let name = name.to_owned();
        let channel = blocking(&self.store, move |s| s.create_channel(owner, &name)).await?;

        let mut cache = self.cache();
        cache.members.insert(channel.id, HashSet::from([owner]));
        cache.invalidate(channel.id);
        drop(cache);

        tracing::info!(channel_id = %channel.id, name = %channel.name, %owner, "channel created");
        Ok(channel)
    }

    /// All channels, oldest first.
    pub async fn list(&self) -> Result<Vec<ChannelInfo>, ChannelError> {
        Ok(blocking(&self.store, |s| s.list_channels()).await?)
    }

    pub async fn find(&self, channel: ChannelId) -> Result<ChannelInfo, ChannelError> {
        blocking(&self.store, move |s| s.find_channel(channel))
            .await?
            .ok_or(ChannelError::NotFound(channel))
    }

    // -- Membership --------------------------------------------------------

    /// Adds `user` to `channel`, durably, before returning.
    pub async fn join(
        &self,
        user: UserId,
        channel: ChannelId,
    ) -> Result<ChannelInfo, ChannelError> {
        let info = self.find(channel).await?;
        let added = blocking(&self.store, move |s| s.add_member(channel, user)).await?;
        if !added {
            return Err(ChannelError::AlreadyMember(user, channel));
        }

        let mut cache = self.cache();
        if let Some(members) = cache.members.get_mut(&channel) {
            members.insert(user);
        }
        cache.invalidate(channel);
        drop(cache);

        tracing::debug!(%user, channel_id = %channel, "joined channel");
        Ok(info)
    }

    /// Removes `user` from `channel`, durably, before returning.
    pub async fn leave(&self, user: UserId, channel: ChannelId) -> Result<(), ChannelError> {
        self.find(channel).await?;
        let removed = blocking(&self.store, move |s| s.remove_member(channel, user)).await?;
        if !removed {
            return Err(ChannelError::NotMember(user, channel));
        }

        let mut cache = self.cache();
        if let Some(members) = cache.members.get_mut(&channel) {
            members.remove(&user);
        }
        cache.invalidate(channel);
        drop(cache);

        tracing::debug!(%user, channel_id = %channel, "left channel");
        Ok(())
    }

    /// Durable membership check.
    ///
    /// # Errors
    /// [`ChannelError::NotFound`] if the channel does not exist,
    /// [`ChannelError::NotMember`] if `user` is not in it.
    pub async fn ensure_member(
        &self,
        user: UserId,
        channel: ChannelId,
    ) -> Result<(), ChannelError> {
        let (exists, member) = blocking(&self.store, move |s| {
            let exists = s.find_channel(channel)?.is_some();
            let member = exists && s.is_member(channel, user)?;
            Ok((exists, member))
        })
        .await?;
        match (exists, member) {
            (false, _) => Err(ChannelError::NotFound(channel)),
            (true, false) => Err(ChannelError::NotMember(user, channel)),
            (true, true) => Ok(()),
        }
    }

    async fn members(&self, channel: ChannelId) -> Result<HashSet<UserId>, ChannelError> {
        let generation = {
            let cache = self.cache();
            if let Some(members) = cache.members.get(&channel) {
                return Ok(members.clone());
            }
            cache.generation
        };

        let members = blocking(&self.store, move |s| s.list_members(channel)).await?;

        let mut cache = self.cache();
        if cache.generation == generation {
            cache.members.insert(channel, members.clone());
        }
        Ok(members)
    }

    // -- Online sets -------------------------------------------------------

    /// Live, authenticated sessions of `channel`'s members.
    ///
    /// A cached set is re-checked against the registry on every call; if any
    /// entry is no longer the registered session for its user, the set is
    /// rebuilt. A set computed while a join, leave or login raced with it is
    /// returned but not cached.
    pub async fn members_online(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<Arc<Session>>, ChannelError> {
        let (cached, generation) = {
            let cache = self.cache();
            (cache.online.get(&channel).cloned(), cache.generation)
        };
        if let Some(sessions) = cached {
            if sessions.iter().all(|s| self.is_live(s)) {
                return Ok(sessions);
            }
            tracing::debug!(channel_id = %channel, "stale online set, rebuilding");
        }

        let members = self.members(channel).await?;
        let online: Vec<Arc<Session>> = members
            .iter()
            .filter_map(|user| self.registry.lookup(*user))
            .filter(|s| self.is_live(s))
            .collect();

        let mut cache = self.cache();
        if cache.generation == generation {
            cache.online.insert(channel, online.clone());
        }
        Ok(online)
    }

    fn is_live(&self, session: &Session) -> bool {
        session.is_authenticated()
            && session
                .user_id()
                .is_some_and(|user| self.registry.is_current(user, session.id()))
    }

    /// Starts tracking a freshly authenticated session.
    ///
    /// Online sets built before the login do not contain it, so they are
    /// dropped.
    pub fn user_online(&self, session: &Arc<Session>) {
        let observer: Weak<dyn SessionObserver> = self.this.clone();
        if session.observe(observer) {
            let mut cache = self.cache();
            cache.online.clear();
            cache.generation += 1;
        }
    }

    // -- Ordering ----------------------------------------------------------

    /// Locks `channel`'s sequencer.
    ///
    /// Holding the guard across "append to the log, then enqueue the
    /// broadcast" makes delivery order equal id order. Different channels
    /// never contend.
    pub async fn sequencer(&self, channel: ChannelId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut sequencers = self
                .sequencers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(sequencers.entry(channel).or_default())
        };
        lock.lock_owned().await
    }
}

impl SessionObserver for ChannelDirectory {
    fn session_closed(&self, session: &Session) {
        let mut cache = self.cache();
        for sessions in cache.online.values_mut() {
            sessions.retain(|s| s.id() != session.id());
        }
    }
}
