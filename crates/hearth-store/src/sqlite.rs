//! [`Store`] backed by a single SQLite connection.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use hearth_protocol::{ChannelId, ChannelInfo, Image, MessageId, MessageRecord, UserId};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::migrations::migrations;
use crate::{Credential, Store, StoreError, UserRecord};

/// SQLite-backed store.
///
/// rusqlite is synchronous, so the connection sits behind a `Mutex`; async
/// callers go through [`blocking`](crate::blocking). Every method is one
/// short transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a database file and brings its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Opens a private in-memory database. Contents die with the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations().to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // No method leaves the connection mid-transaction on panic: an
        // unfinished `Transaction` rolls back when dropped.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// SQLite integers are i64; ids are never negative.
fn to_sql_id(id: u64) -> i64 {
    id as i64
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: UserId(row.get::<_, i64>(0)? as u64),
        username: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelInfo> {
    Ok(ChannelInfo {
        id: ChannelId(row.get::<_, i64>(0)? as u64),
        name: row.get(1)?,
        owner: UserId(row.get::<_, i64>(2)? as u64),
        created_at: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let data: Option<Vec<u8>> = row.get(7)?;
    let image = match data {
        Some(data) => Some(Image {
            width: row.get(5)?,
            height: row.get(6)?,
            data,
        }),
        None => None,
    };
    Ok(MessageRecord {
        channel_id: ChannelId(row.get::<_, i64>(0)? as u64),
        id: MessageId(row.get::<_, i64>(1)? as u64),
        author: UserId(row.get::<_, i64>(2)? as u64),
        body: row.get(3)?,
        image,
        timestamp: row.get(4)?,
    })
}

const USER_COLUMNS: &str = "id, username, display_name, created_at";
const CHANNEL_COLUMNS: &str = "id, name, owner_id, created_at";
const MESSAGE_COLUMNS: &str =
    "channel_id, message_id, author_id, body, created_at, image_width, image_height, image_data";

impl Store for SqliteStore {
    fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![to_sql_id(id.0)],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn create_user(
        &self,
        username: &str,
        display_name: &str,
        credential: &Credential,
    ) -> Result<UserRecord, StoreError> {
        let conn = self.conn();
        let created_at = now_millis();
        let inserted = conn.execute(
            "INSERT INTO users (username, display_name, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, display_name, credential.hash(), created_at],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if StoreError::is_unique_violation(&e) => {
                return Err(StoreError::UsernameTaken(username.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }
        let id = UserId(conn.last_insert_rowid() as u64);
        tracing::debug!(user_id = %id, username, "user created");
        Ok(UserRecord {
            id,
            username: username.to_owned(),
            display_name: display_name.to_owned(),
            created_at,
        })
    }

    fn verify_credential(&self, id: UserId, attempt: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let stored = conn
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                params![to_sql_id(id.0)],
                |row| Ok(Credential::from_hash(row.get(0)?)),
            )
            .optional()?;
        // Unlock before the deliberately slow hash check.
        drop(conn);
        match stored {
            Some(credential) => credential.verify(attempt),
            None => Ok(false),
        }
    }

    fn update_display_name(
        &self,
        id: UserId,
        display_name: &str,
    ) -> Result<UserRecord, StoreError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                &format!(
                    "UPDATE users SET display_name = ?2 WHERE id = ?1
                     RETURNING {USER_COLUMNS}"
                ),
                params![to_sql_id(id.0), display_name],
                user_from_row,
            )
            .optional()?;
        user.ok_or(StoreError::UserNotFound(id))
    }

    fn create_channel(&self, owner: UserId, name: &str) -> Result<ChannelInfo, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let created_at = now_millis();
        let inserted = tx.execute(
            "INSERT INTO channels (name, owner_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, to_sql_id(owner.0), created_at],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if StoreError::is_unique_violation(&e) => {
                return Err(StoreError::ChannelNameTaken(name.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }
        let id = ChannelId(tx.last_insert_rowid() as u64);
        tx.execute(
            "INSERT INTO memberships (channel_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![to_sql_id(id.0), to_sql_id(owner.0), created_at],
        )?;
        tx.commit()?;

        tracing::debug!(channel_id = %id, name, owner = %owner, "channel created");
        Ok(ChannelInfo {
            id,
            name: name.to_owned(),
            owner,
            created_at,
        })
    }

    fn find_channel(&self, id: ChannelId) -> Result<Option<ChannelInfo>, StoreError> {
        let conn = self.conn();
        let channel = conn
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![to_sql_id(id.0)],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id"))?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    fn append_message(
        &self,
        channel: ChannelId,
        author: UserId,
        body: &str,
        image: Option<&Image>,
    ) -> Result<MessageRecord, StoreError> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front, so two writers can never
        // read the same `last_message_id`.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next: Option<i64> = tx
            .query_row(
                "UPDATE channels SET last_message_id = last_message_id + 1
                 WHERE id = ?1 RETURNING last_message_id",
                params![to_sql_id(channel.0)],
                |row| row.get(0),
            )
            .optional()?;
        let Some(next) = next else {
            return Err(StoreError::ChannelNotFound(channel));
        };

        let timestamp = now_millis();
        tx.execute(
            "INSERT INTO messages
                (channel_id, message_id, author_id, body, created_at,
                 image_width, image_height, image_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                to_sql_id(channel.0),
                next,
                to_sql_id(author.0),
                body,
                timestamp,
                image.map(|i| i.width),
                image.map(|i| i.height),
                image.map(|i| i.data.as_slice()),
            ],
        )?;
        tx.commit()?;

        Ok(MessageRecord {
            id: MessageId(next as u64),
            channel_id: channel,
            author,
            body: body.to_owned(),
            image: image.cloned(),
            timestamp,
        })
    }

    fn history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn();
        let before = before.map_or(i64::MAX, |id| to_sql_id(id.0));
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1 AND message_id < ?2
             ORDER BY message_id DESC LIMIT ?3"
        ))?;
        let messages = stmt
            .query_map(
                params![to_sql_id(channel.0), before, i64::from(limit)],
                message_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn list_members(&self, channel: ChannelId) -> Result<HashSet<UserId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT user_id FROM memberships WHERE channel_id = ?1")?;
        let members = stmt
            .query_map(params![to_sql_id(channel.0)], |row| {
                Ok(UserId(row.get::<_, i64>(0)? as u64))
            })?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(members)
    }

    fn is_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM memberships WHERE channel_id = ?1 AND user_id = ?2",
                params![to_sql_id(channel.0), to_sql_id(user.0)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn add_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO memberships (channel_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![to_sql_id(channel.0), to_sql_id(user.0), now_millis()],
        )?;
        Ok(inserted == 1)
    }

    fn remove_member(&self, channel: ChannelId, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM memberships WHERE channel_id = ?1 AND user_id = ?2",
            params![to_sql_id(channel.0), to_sql_id(user.0)],
        )?;
        Ok(removed == 1)
    }
}
