//! # courier-store
//!
//! Durable storage for Courier: messages, the user directory and each
//! user's persisted online state.
//!
//! The store is the single source of truth. Everything in memory (the
//! presence registry, in-flight deliveries) can be rebuilt from nothing,
//! but a message only exists once [`MessageStore::save_message`] returned.

mod error;
mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{ConnectionId, Message, User, UserId};

pub use error::StoreError;
pub use sqlite::SqliteStore;

/// A presence transition to persist.
///
/// Each transition carries the connection that caused it. Going offline
/// only takes effect if that connection is still the one that last marked
/// the user online, so a stale disconnect cannot overwrite a newer
/// registration made through another connection or process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnlineStatus {
    Online {
        connection: ConnectionId,
    },
    Offline {
        connection: ConnectionId,
        last_seen: DateTime<Utc>,
    },
}

/// Persistence contract used by the delivery router.
///
/// Every call may suspend. Writes are atomic: a reader never observes a
/// partially written row.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. `content` is stored exactly as given.
    ///
    /// # Errors
    ///
    /// [`StoreError::EmptyContent`] if `content` is blank after trimming,
    /// [`StoreError::UserNotFound`] if either user does not exist.
    async fn save_message(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// The conversation between `a` and `b` in either direction, ordered by
    /// creation time then id. Empty when they never talked.
    async fn messages_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError>;

    /// Update exactly one user's online state.
    ///
    /// Returns `false` when an offline transition was superseded by a newer
    /// registration and therefore not applied.
    ///
    /// # Errors
    ///
    /// [`StoreError::UserNotFound`] if the user does not exist.
    async fn set_user_online_status(
        &self,
        user: UserId,
        status: OnlineStatus,
    ) -> Result<bool, StoreError>;

    /// Mark every unread message from `peer` to `reader` as read.
    /// Returns the number of messages changed.
    async fn mark_read(&self, reader: UserId, peer: UserId) -> Result<u64, StoreError>;

    /// Look up one user.
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// All users except `id`, ordered by username.
    async fn list_users_except(&self, id: UserId) -> Result<Vec<User>, StoreError>;

    /// Add a user to the directory.
    async fn create_user(&self, username: &str, email: &str) -> Result<User, StoreError>;

    /// Mark every user offline. Used when a single-instance deployment
    /// starts, since no connection survived the restart.
    async fn reset_presence(&self) -> Result<u64, StoreError>;
}
