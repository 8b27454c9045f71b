use hearth_protocol::{ChannelId, UserId};

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQLite call failed.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Bringing the schema up to date failed.
    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// An account with this username already exists.
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),

    /// A channel with this name already exists.
    #[error("channel name {0:?} is already taken")]
    ChannelNameTaken(String),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    /// Hashing a password, or reading a stored hash, failed.
    #[error("password hash: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    /// The blocking task running the operation panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Returns `true` if the error came from a UNIQUE constraint.
    pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
