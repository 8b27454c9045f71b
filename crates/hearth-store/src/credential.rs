//! Password hashing.
//!
//! A [`Credential`] is a bcrypt hash string. The salt and cost are embedded
//! in it, so it is the only thing stored. Passwords never touch the
//! database.

use crate::StoreError;

pub use bcrypt::DEFAULT_COST;

/// Lowest cost bcrypt accepts (mirrors bcrypt's private constant).
pub const MIN_COST: u32 = 4;
/// Highest cost bcrypt accepts (mirrors bcrypt's private constant).
pub const MAX_COST: u32 = 31;

/// Longest password bcrypt looks at, in bytes. Anything past it would be
/// silently ignored, so callers refuse longer passwords up front.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// A stored password verifier.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    hash: String,
}

impl Credential {
    /// Hashes `password` with a fresh salt at the given bcrypt cost.
    ///
    /// # Errors
    /// [`StoreError::Hash`] if the cost is outside
    /// [`MIN_COST`]`..=`[`MAX_COST`].
    pub fn derive(password: &str, cost: u32) -> Result<Self, StoreError> {
        let hash = bcrypt::hash(password, cost)?;
        Ok(Self { hash })
    }

    /// Rebuilds a credential from its stored hash string.
    pub fn from_hash(hash: String) -> Self {
        Self { hash }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Checks a password attempt.
    ///
    /// # Errors
    /// [`StoreError::Hash`] if the stored string is not a bcrypt hash.
    pub fn verify(&self, attempt: &str) -> Result<bool, StoreError> {
        Ok(bcrypt::verify(attempt, &self.hash)?)
    }
}

// Hashes stay out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}
