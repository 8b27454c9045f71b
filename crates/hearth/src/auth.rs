//! Account checks behind `Register` and `Login`.
//!
//! [`Accounts`] validates what a peer typed and asks the store; it knows
//! nothing about sessions. Deciding what a failure costs the connection is
//! the router's job.

use std::sync::Arc;

use hearth_store::{
    Credential, MAX_COST, MAX_PASSWORD_BYTES, MIN_COST, Store, StoreError, UserRecord, blocking,
};

/// Longest accepted username, in characters.
pub const MAX_USERNAME_LEN: usize = 32;

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 32;

/// Why a login or registration was refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("usernames are 1 to {MAX_USERNAME_LEN} letters, digits, '-' or '_'")]
    InvalidUsername,

    #[error("passwords are 1 to {MAX_PASSWORD_BYTES} bytes")]
    InvalidPassword,

    #[error("username is already taken")]
    UsernameTaken,

    /// Unknown user or wrong password. The two are not told apart.
    #[error("invalid username or password")]
    BadCredentials,

    /// The store failed; the peer did nothing wrong.
    #[error(transparent)]
    Store(StoreError),
}

impl AuthFailure {
    /// Whether the failure counts against the connection's login attempts.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

pub fn is_valid_username(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Trims a requested display name, returning `None` if nothing usable is
/// left or it is too long.
pub fn normalize_display_name(name: &str) -> Option<&str> {
    let name = name.trim();
    let len = name.chars().count();
    (1..=MAX_DISPLAY_NAME_LEN).contains(&len).then_some(name)
}

fn check_password(password: &str) -> Result<(), AuthFailure> {
    if (1..=MAX_PASSWORD_BYTES).contains(&password.len()) {
        Ok(())
    } else {
        Err(AuthFailure::InvalidPassword)
    }
}

/// Credential checks over a [`Store`].
pub struct Accounts {
    store: Arc<dyn Store>,
    cost: u32,
}

impl Accounts {
    /// `cost` is the bcrypt work factor for new passwords, clamped to the
    /// range bcrypt accepts.
    pub fn new(store: Arc<dyn Store>, cost: u32) -> Self {
        Self {
            store,
            cost: cost.clamp(MIN_COST, MAX_COST),
        }
    }

    /// Creates an account. The display name starts out as the username.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserRecord, AuthFailure> {
        if !is_valid_username(username) {
            return Err(AuthFailure::InvalidUsername);
        }
        check_password(password)?;

        let username = username.to_owned();
        let password = password.to_owned();
        let cost = self.cost;
        // bcrypt is slow; it runs on the blocking pool with the insert.
        let created = blocking(&self.store, move |s| {
            let credential = Credential::derive(&password, cost)?;
            s.create_user(&username, &username, &credential)
        })
        .await;

        match created {
            Ok(user) => {
                tracing::info!(user_id = %user.id, username = %user.username, "account created");
                Ok(user)
            }
            Err(StoreError::UsernameTaken(_)) => Err(AuthFailure::UsernameTaken),
            Err(e) => Err(AuthFailure::Store(e)),
        }
    }

    /// Checks a username and password pair.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserRecord, AuthFailure> {
        if !is_valid_username(username) || check_password(password).is_err() {
            return Err(AuthFailure::BadCredentials);
        }

        let username = username.to_owned();
        let password = password.to_owned();
        let found = blocking(&self.store, move |s| {
            let Some(user) = s.find_user_by_name(&username)? else {
                return Ok(None);
            };
            let verified = s.verify_credential(user.id, &password)?;
            Ok(verified.then_some(user))
        })
        .await
        .map_err(AuthFailure::Store)?;

        found.ok_or(AuthFailure::BadCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_store::SqliteStore;

    fn accounts() -> Accounts {
        Accounts::new(Arc::new(SqliteStore::open_in_memory().unwrap()), MIN_COST)
    }

    #[test]
    fn test_is_valid_username_rules() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("bob_the-2nd"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("has space"));
        assert!(!is_valid_username(&"x".repeat(MAX_USERNAME_LEN + 1)));
    }

    #[test]
    fn test_normalize_display_name_trims_and_bounds() {
        assert_eq!(normalize_display_name("  Alice  "), Some("Alice"));
        assert_eq!(normalize_display_name("   "), None);
        assert_eq!(
            normalize_display_name(&"é".repeat(MAX_DISPLAY_NAME_LEN)).map(str::len),
            Some(64)
        );
        assert_eq!(normalize_display_name(&"x".repeat(MAX_DISPLAY_NAME_LEN + 1)), None);
    }

    #[tokio::test]
    async fn test_register_then_login_succeeds() {
        let accounts = accounts();
        let created = accounts.register("alice", "s3cret").await.unwrap();
        assert_eq!(created.display_name, "alice");

        let logged_in = accounts.login("alice", "s3cret").await.unwrap();
        assert_eq!(logged_in.id, created.id);
    }

    #[tokio::test]
    async fn test_register_duplicate_returns_username_taken() {
        let accounts = accounts();
        accounts.register("alice", "pw").await.unwrap();

        let err = accounts.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, AuthFailure::UsernameTaken));
        assert!(err.is_peer_fault());
    }

    #[tokio::test]
    async fn test_register_empty_password_is_rejected() {
        let err = accounts().register("alice", "").await.unwrap_err();
        assert!(matches!(err, AuthFailure::InvalidPassword));
    }

    #[tokio::test]
    async fn test_register_password_past_bcrypt_limit_is_rejected() {
        let accounts = accounts();
        let longest = "p".repeat(MAX_PASSWORD_BYTES);
        accounts.register("alice", &longest).await.unwrap();

        let err = accounts
            .register("bob", &"p".repeat(MAX_PASSWORD_BYTES + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::InvalidPassword));
    }

    #[tokio::test]
    async fn test_login_only_accepts_exact_long_password() {
        let accounts = accounts();
        let password = "x".repeat(MAX_PASSWORD_BYTES);
        accounts.register("alice", &password).await.unwrap();

        // bcrypt ignores bytes past its limit; those logins are refused first.
        let extended = format!("{password}y");
        let err = accounts.login("alice", &extended).await.unwrap_err();
        assert!(matches!(err, AuthFailure::BadCredentials));
        assert!(accounts.login("alice", &password).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_clamps_cost_into_bcrypt_range() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let accounts = Accounts::new(Arc::clone(&store), 0);
        let user = accounts.register("alice", "pw").await.unwrap();

        assert!(store.verify_credential(user.id, "pw").unwrap());
    }

    #[tokio::test]
    async fn test_login_wrong_password_and_unknown_user_look_alike() {
        let accounts = accounts();
        accounts.register("alice", "right").await.unwrap();

        let wrong = accounts.login("alice", "wrong").await.unwrap_err();
        let unknown = accounts.login("mallory", "right").await.unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[test]
    fn test_store_failure_is_not_peer_fault() {
        let err = AuthFailure::Store(StoreError::TaskFailed("boom".into()));
        assert!(!err.is_peer_fault());
    }
}
