//! SQLite-backed [`MessageStore`].
//!
//! A single connection behind a mutex serializes all writes, including
//! the online-status read-modify-write. Every call runs on the blocking
//! pool so the async runtime never waits on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{Message, MessageId, User, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::{migrations, MessageStore, OnlineStatus, StoreError};

const USER_COLUMNS: &str = "id, username, email, is_online, last_seen_at";
const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at, is_read";

/// Message store on a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        let store = Self::with_connection(conn)?;
        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrations::run(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))?;
            f(&mut *guard)
        })
        .await?
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save_message(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let content = content.to_string();

        self.run(move |conn| {
            let tx = conn.transaction()?;
            for user in [sender, receiver] {
                if !user_exists(&tx, user)? {
                    return Err(StoreError::UserNotFound(user));
                }
            }

            let created_at = now_millis();
            tx.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![sender.0, receiver.0, content, created_at],
            )?;
            let id = MessageId(tx.last_insert_rowid());
            tx.commit()?;

            debug!(message = %id, sender = %sender, receiver = %receiver, "Message persisted");

            Ok(Message {
                id,
                sender_id: sender,
                receiver_id: receiver,
                content,
                created_at: millis_to_utc(created_at),
                is_read: false,
            })
        })
        .await
    }

    async fn messages_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC, id ASC"
            ))?;

            let rows = stmt
                .query_map(params![a.0, b.0], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows)
        })
        .await
    }

    async fn set_user_online_status(
        &self,
        user: UserId,
        status: OnlineStatus,
    ) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = match &status {
                OnlineStatus::Online { connection } => conn.execute(
                    "UPDATE users SET is_online = 1, last_seen_at = NULL, presence_token = ?2 WHERE id = ?1",
                    params![user.0, connection.as_str()],
                )?,
                OnlineStatus::Offline {
                    connection,
                    last_seen,
                } => conn.execute(
                    "UPDATE users SET is_online = 0, last_seen_at = ?3, presence_token = NULL
                     WHERE id = ?1 AND presence_token = ?2",
                    params![user.0, connection.as_str(), last_seen.timestamp_millis()],
                )?,
            };

            if changed == 1 {
                return Ok(true);
            }
            if !user_exists(conn, user)? {
                return Err(StoreError::UserNotFound(user));
            }

            debug!(user = %user, "Offline transition superseded by a newer registration");
            Ok(false)
        })
        .await
    }

    async fn mark_read(&self, reader: UserId, peer: UserId) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![peer.0, reader.0],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.run(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    [id.0],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn list_users_except(&self, id: UserId) -> Result<Vec<User>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id != ?1 ORDER BY username ASC"
            ))?;

            let users = stmt
                .query_map([id.0], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(users)
        })
        .await
    }

    async fn create_user(&self, username: &str, email: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        let email = email.to_string();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (username, email, created_at) VALUES (?1, ?2, ?3)",
                params![username, email, now_millis()],
            )?;

            Ok(User {
                id: UserId(conn.last_insert_rowid()),
                username,
                email,
                is_online: false,
                last_seen_at: None,
            })
        })
        .await
    }

    async fn reset_presence(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_online = 0, presence_token = NULL, last_seen_at = ?1
                 WHERE is_online = 1",
                [now_millis()],
            )?;
            Ok(changed as u64)
        })
        .await
    }
}

fn user_exists(conn: &Connection, id: UserId) -> Result<bool, StoreError> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id.0], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get(0)?),
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        content: row.get(3)?,
        created_at: millis_to_utc(row.get(4)?),
        is_read: row.get(5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let is_online: bool = row.get(3)?;
    let last_seen: Option<i64> = row.get(4)?;

    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        email: row.get(2)?,
        is_online,
        last_seen_at: if is_online {
            None
        } else {
            last_seen.map(millis_to_utc)
        },
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::ConnectionId;

    async fn store_with_users() -> (SqliteStore, UserId, UserId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.create_user("alice", "alice@example.com").await.unwrap();
        let bob = store.create_user("bob", "bob@example.com").await.unwrap();
        (store, alice.id, bob.id)
    }

    #[tokio::test]
    async fn test_save_then_fetch_preserves_content() {
        let (store, alice, bob) = store_with_users().await;

        let saved = store
            .save_message(alice, bob, "  hi there\n")
            .await
            .unwrap();
        let history = store.messages_between(alice, bob).await.unwrap();

        assert_eq!(history, vec![saved.clone()]);
        assert_eq!(history[0].content, "  hi there\n");
        assert_eq!(history[0].sender_id, alice);
        assert_eq!(history[0].receiver_id, bob);
        assert!(!history[0].is_read);
    }

    #[tokio::test]
    async fn test_conversation_is_symmetric_and_ordered() {
        let (store, alice, bob) = store_with_users().await;

        let m1 = store.save_message(alice, bob, "one").await.unwrap();
        let m2 = store.save_message(bob, alice, "two").await.unwrap();
        let m3 = store.save_message(alice, bob, "three").await.unwrap();

        let ab = store.messages_between(alice, bob).await.unwrap();
        let ba = store.messages_between(bob, alice).await.unwrap();

        assert_eq!(ab, ba);
        assert_eq!(
            ab.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![m1.id, m2.id, m3.id]
        );
    }

    #[tokio::test]
    async fn test_empty_conversation_is_not_an_error() {
        let (store, alice, bob) = store_with_users().await;
        assert!(store.messages_between(alice, bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_content_rejected() {
        let (store, alice, bob) = store_with_users().await;

        assert!(matches!(
            store.save_message(alice, bob, " \t\n").await,
            Err(StoreError::EmptyContent)
        ));
        assert!(store.messages_between(alice, bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_receiver_rejected() {
        let (store, alice, _) = store_with_users().await;

        assert!(matches!(
            store.save_message(alice, UserId(999), "hi").await,
            Err(StoreError::UserNotFound(UserId(999)))
        ));
    }

    #[tokio::test]
    async fn test_stale_offline_does_not_clobber_newer_online() {
        let (store, alice, _) = store_with_users().await;
        let first = ConnectionId::new("conn-1");
        let second = ConnectionId::new("conn-2");

        store
            .set_user_online_status(alice, OnlineStatus::Online { connection: first.clone() })
            .await
            .unwrap();
        store
            .set_user_online_status(alice, OnlineStatus::Online { connection: second.clone() })
            .await
            .unwrap();

        let applied = store
            .set_user_online_status(
                alice,
                OnlineStatus::Offline {
                    connection: first,
                    last_seen: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.get_user(alice).await.unwrap().unwrap().is_online);

        let applied = store
            .set_user_online_status(
                alice,
                OnlineStatus::Offline {
                    connection: second,
                    last_seen: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let user = store.get_user(alice).await.unwrap().unwrap();
        assert!(!user.is_online);
        assert!(user.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_status_for_unknown_user() {
        let (store, _, _) = store_with_users().await;

        let result = store
            .set_user_online_status(
                UserId(42),
                OnlineStatus::Online {
                    connection: ConnectionId::new("conn-1"),
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::UserNotFound(UserId(42)))));
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_incoming() {
        let (store, alice, bob) = store_with_users().await;

        store.save_message(alice, bob, "to bob").await.unwrap();
        store.save_message(alice, bob, "again").await.unwrap();
        store.save_message(bob, alice, "to alice").await.unwrap();

        assert_eq!(store.mark_read(bob, alice).await.unwrap(), 2);
        assert_eq!(store.mark_read(bob, alice).await.unwrap(), 0);

        let history = store.messages_between(alice, bob).await.unwrap();
        let unread: Vec<_> = history.iter().filter(|m| !m.is_read).collect();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].sender_id, bob);
    }

    #[tokio::test]
    async fn test_directory_listing_excludes_self() {
        let (store, alice, bob) = store_with_users().await;
        let carol = store.create_user("carol", "carol@example.com").await.unwrap();

        let others = store.list_users_except(alice).await.unwrap();
        assert_eq!(
            others.iter().map(|u| u.id).collect::<Vec<_>>(),
            vec![bob, carol.id]
        );
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let (store, _, _) = store_with_users().await;
        assert!(matches!(
            store.create_user("alice", "other@example.com").await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_reset_presence() {
        let (store, alice, bob) = store_with_users().await;
        store
            .set_user_online_status(
                alice,
                OnlineStatus::Online {
                    connection: ConnectionId::new("conn-1"),
                },
            )
            .await
            .unwrap();

        assert_eq!(store.reset_presence().await.unwrap(), 1);
        assert!(!store.get_user(alice).await.unwrap().unwrap().is_online);
        assert!(!store.get_user(bob).await.unwrap().unwrap().is_online);
    }
}
