//! Presence registry for Courier.
//!
//! Process-local map from user identity to the live connection that
//! registered it, plus the set of every attached connection (registered or
//! not) so presence changes can reach all of them.

use courier_protocol::{ConnectionId, ServerFrame, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// An opaque reference to one live transport connection.
///
/// Frames sent through the handle are queued in order and written by the
/// connection's own task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Arc<ServerFrame>>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound queue.
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Arc<ServerFrame>>) -> Self {
        Self { id, tx }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Arc<ServerFrame>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame. Returns `false` if the connection is gone.
    pub fn send(&self, frame: Arc<ServerFrame>) -> bool {
        self.tx.send(frame).is_ok()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Attached connections, registered or not.
    pub connection_count: usize,
    /// Users with a registered connection on this process.
    pub online_count: usize,
}

/// The per-process presence registry.
///
/// Every operation is a single per-key map update, so readers never see a
/// half-applied change and no lock outlives the call.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// Registered connection per user.
    users: DashMap<UserId, ConnectionHandle>,
    /// Every attached connection.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Per-user locks taken while a registration changes.
    registrations: DashMap<UserId, Arc<Mutex<()>>>,
}

/// Exclusive right to change one user's registration on this process.
///
/// Released on drop.
#[derive(Debug)]
pub struct RegistrationGuard<'a> {
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the lock: nobody is waiting on it.
        self.locks
            .remove_if(&self.user, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection for broadcasts.
    pub fn attach(&self, handle: ConnectionHandle) {
        trace!(connection = %handle.id(), "Attached connection");
        self.connections.insert(handle.id().clone(), handle);
    }

    /// Stop tracking a connection for broadcasts.
    pub fn detach(&self, connection: &ConnectionId) -> bool {
        let removed = self.connections.remove(connection).is_some();
        if removed {
            trace!(connection = %connection, "Detached connection");
        }
        removed
    }

    /// Wait for exclusive access to `user`'s registration.
    ///
    /// Store writes and registry updates for the user made while the guard
    /// is held cannot interleave with those of another connection.
    pub async fn lock_user(&self, user: UserId) -> RegistrationGuard<'_> {
        let lock = Arc::clone(self.registrations.entry(user).or_default().value());
        let guard = lock.lock_owned().await;
        RegistrationGuard {
            locks: &self.registrations,
            user,
            guard: Some(guard),
        }
    }

    /// Register `handle` as the connection for `user`.
    ///
    /// Any previous handle for the user is replaced and returned. The
    /// evicted connection gets no disconnect event of its own.
    pub fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let connection = handle.id().clone();
        let previous = self.users.insert(user, handle);

        match &previous {
            Some(old) if old.id() != &connection => {
                debug!(
                    user = %user,
                    connection = %connection,
                    evicted = %old.id(),
                    "Replaced stale registration"
                );
            }
            _ => debug!(user = %user, connection = %connection, "Registered"),
        }

        previous.filter(|old| old.id() != &connection)
    }

    /// Remove `user`'s entry, but only if it still belongs to `connection`.
    ///
    /// Returns `true` if this call removed the entry.
    pub fn unregister(&self, user: UserId, connection: &ConnectionId) -> bool {
        let removed = self
            .users
            .remove_if(&user, |_, handle| handle.id() == connection)
            .is_some();

        if removed {
            debug!(user = %user, connection = %connection, "Unregistered");
        } else {
            debug!(
                user = %user,
                connection = %connection,
                "Skipped unregister, entry superseded"
            );
        }

        removed
    }

    /// The connection registered for `user` on this process.
    #[must_use]
    pub fn lookup(&self, user: UserId) -> Option<ConnectionHandle> {
        self.users.get(&user).map(|entry| entry.value().clone())
    }

    /// Users registered on this process.
    #[must_use]
    pub fn snapshot_online_user_ids(&self) -> HashSet<UserId> {
        self.users.iter().map(|entry| *entry.key()).collect()
    }

    /// Queue a frame on every attached connection except `except`.
    ///
    /// Returns the number of connections reached.
    pub fn broadcast(&self, frame: &Arc<ServerFrame>, except: Option<&ConnectionId>) -> usize {
        let mut reached = 0;

        for entry in self.connections.iter() {
            if Some(entry.key()) == except {
                continue;
            }
            if entry.value().send(Arc::clone(frame)) {
                reached += 1;
            }
        }

        trace!(event = frame.event_name(), reached, "Broadcast");
        reached
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connection_count(),
            online_count: self.online_count(),
        }
    }
}
