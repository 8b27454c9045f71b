//! Error types for the channel layer.

use hearth_protocol::{ChannelId, ErrorCode, UserId};
use hearth_store::StoreError;

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel does not exist.
    #[error("channel {0} not found")]
    NotFound(ChannelId),

    #[error("user {0} is already a member of {1}")]
    AlreadyMember(UserId, ChannelId),

    #[error("user {0} is not a member of {1}")]
    NotMember(UserId, ChannelId),

    /// Another channel already uses this name.
    #[error("channel name {0:?} is taken")]
    NameTaken(String),

    /// Names are 1 to 64 characters of letters, digits, `-` and `_`.
    #[error("invalid channel name {0:?}")]
    InvalidName(String),

    /// The store failed underneath the operation.
    #[error(transparent)]
    Store(StoreError),
}

impl ChannelError {
    /// The wire code reported to the requesting peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyMember(..) => ErrorCode::AlreadyMember,
            Self::NotMember(..) => ErrorCode::NotMember,
            Self::NameTaken(_) => ErrorCode::NameTaken,
            Self::InvalidName(_) => ErrorCode::InvalidInput,
            Self::Store(_) => ErrorCode::PersistenceFailure,
        }
    }
}

impl From<StoreError> for ChannelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChannelNotFound(id) => Self::NotFound(id),
            StoreError::ChannelNameTaken(name) => Self::NameTaken(name),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_store_error_maps_domain_variants() {
        let err: ChannelError = StoreError::ChannelNameTaken("general".into()).into();
        assert!(matches!(err, ChannelError::NameTaken(ref n) if n == "general"));
        assert_eq!(err.code(), ErrorCode::NameTaken);

        let err: ChannelError = StoreError::ChannelNotFound(ChannelId(3)).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_from_store_error_other_is_persistence_failure() {
        let err: ChannelError = StoreError::TaskFailed("panicked".into()).into();
        assert_eq!(err.code(), ErrorCode::PersistenceFailure);
    }
}
