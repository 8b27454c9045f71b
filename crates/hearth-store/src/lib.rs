//! Durable storage for hearth.
//!
//! Everything that must survive a restart goes through the [`Store`] trait:
//! accounts and their bcrypt credentials, channels, memberships, and each channel's
//! append-only message log. [`SqliteStore`] is the production
//! implementation.
//!
//! # Message identifiers
//!
//! [`Store::append_message`] is the only place message ids are minted. Each
//! call runs in its own write transaction that bumps the channel's counter
//! and inserts the row, so ids within a channel are `1, 2, 3, ...` with no
//! gaps or duplicates, however many threads append at once.
//!
//! # Async callers
//!
//! The trait is synchronous. Async code wraps calls in [`blocking`], which
//! moves them onto Tokio's blocking thread pool so a slow disk never stalls
//! the reactor.

mod credential;
mod error;
mod migrations;
mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

use hearth_protocol::{
    ChannelId, ChannelInfo, Image, MessageId, MessageRecord, UserId, UserSummary,
};

pub use credential::{Credential, DEFAULT_COST, MAX_COST, MAX_PASSWORD_BYTES, MIN_COST};
pub use error::StoreError;
pub use migrations::migrations;
pub use sqlite::SqliteStore;

/// A stored user account, without its credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    /// Login name. Unique, compared case-insensitively.
    pub username: String,
    pub display_name: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl UserRecord {
    /// The public view sent to other users.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            display_name: self.display_name.clone(),
        }
    }
}

/// Transactional interface to durable state.
///
/// Each method is one short, self-contained transaction. No method holds
/// a lock beyond its own return.
pub trait Store: Send + Sync + 'static {
    fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Creates an account.
    ///
    /// # Errors
    /// [`StoreError::UsernameTaken`] if the username exists.
    fn create_user(
        &self,
        username: &str,
        display_name: &str,
        credential: &Credential,
    ) -> Result<UserRecord, StoreError>;

    /// Checks a password attempt. Unknown users verify as `false`.
    fn verify_credential(&self, id: UserId, attempt: &str) -> Result<bool, StoreError>;

    fn update_display_name(&self, id: UserId, display_name: &str)
    -> Result<UserRecord, StoreError>;

    /// Creates a channel and makes its owner the first member.
    ///
    /// # Errors
    /// [`StoreError::ChannelNameTaken`] if the name exists.
    fn create_channel(&self, owner: UserId, name: &str) -> Result<ChannelInfo, StoreError>;

    fn find_channel(&self, id: ChannelId) -> Result<Option<ChannelInfo>, StoreError>;

    /// All channels, oldest first.
    fn list_channels(&self) -> Result<Vec<ChannelInfo>, StoreError>;

    /// Appends a message and assigns it the channel's next id. An image
    /// message carries its picture in `image` and an optional caption in
    /// `body`.
    ///
    /// # Errors
    /// [`StoreError::ChannelNotFound`] if the channel does not exist. On any
    /// error nothing was written and no id was consumed.
    fn append_message(
        &self,
        channel: ChannelId,
        author: UserId,
        body: &str,
        image: Option<&Image>,
    ) -> Result<MessageRecord, StoreError>;

    /// Up to `limit` messages with ids below `before`, newest first.
    fn history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    fn list_members(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError>;

    fn is_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError>;

    /// Adds a member. Returns `false` if they already were one.
    fn add_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError>;

    /// Removes a member. Returns `false` if they were not one.
    fn remove_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError>;
}

/// Runs a store operation on the blocking thread pool.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use hearth_store::{Store, StoreError};
/// # async fn demo(store: Arc<dyn Store>) -> Result<(), StoreError> {
/// let channels = hearth_store::blocking(&store, |s| s.list_channels()).await?;
/// # Ok(()) }
/// ```
pub async fn blocking<S, F, T>(store: &Arc<S>, op: F) -> Result<T, StoreError>
where
    S: Store + ?Sized,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}
