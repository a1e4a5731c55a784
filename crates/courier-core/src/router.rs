//! Delivery router for Courier.
//!
//! Decides who receives each message, presence change and typing signal.
//! Local connections are served straight from the registry. Everything
//! else goes through the fanout bridge, and envelopes arriving from the
//! bridge are handed to local connections by [`DeliveryRouter::dispatch_remote`].

use crate::error::DeliveryError;
use crate::registry::{ConnectionHandle, PresenceRegistry};
use chrono::Utc;
use courier_fanout::{Envelope, FanoutBridge, Target};
use courier_protocol::{ConnectionId, Message, NodeId, ServerFrame, User, UserId};
use courier_store::{MessageStore, OnlineStatus};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Where a targeted frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on a connection of this process.
    Local,
    /// Handed to the bridge for other processes.
    Forwarded,
    /// Nobody could be reached.
    Dropped,
}

impl DeliveryOutcome {
    /// Label for metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Local => "local",
            DeliveryOutcome::Forwarded => "forwarded",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

/// The delivery router.
///
/// Owns nothing global: the registry, store and bridge are injected, so
/// several routers can run side by side in one process.
pub struct DeliveryRouter {
    node_id: NodeId,
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn MessageStore>,
    bridge: Arc<dyn FanoutBridge>,
}

impl DeliveryRouter {
    /// Create a router with a fresh node id.
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        store: Arc<dyn MessageStore>,
        bridge: Arc<dyn FanoutBridge>,
    ) -> Self {
        let node_id = NodeId::generate();
        info!(node = %node_id, bridge = bridge.name(), "Creating delivery router");
        Self {
            node_id,
            registry,
            store,
            bridge,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<dyn FanoutBridge> {
        &self.bridge
    }

    /// Persist a message, deliver it to the receiver and confirm it to the
    /// sender's connection.
    ///
    /// If persisting fails nothing is delivered to anyone. An unreachable
    /// receiver is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is blank, a user is unknown or the
    /// store fails.
    pub async fn send_message(
        &self,
        origin: &ConnectionHandle,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<(Message, DeliveryOutcome), DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::Validation(
                "Message content cannot be empty".into(),
            ));
        }

        let message = self.store.save_message(sender, receiver, content).await?;

        let outcome = self
            .deliver_to_user(receiver, ServerFrame::NewMessage(message.clone()))
            .await;
        origin.send(Arc::new(ServerFrame::MessageConfirmed(message.clone())));

        debug!(
            message = %message.id,
            sender = %sender,
            receiver = %receiver,
            outcome = outcome.as_str(),
            "Message sent"
        );

        Ok((message, outcome))
    }

    /// The conversation between two users.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn messages_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, DeliveryError> {
        Ok(self.store.messages_between(a, b).await?)
    }

    /// Mark everything `peer` sent to `reader` as read.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn mark_read(&self, reader: UserId, peer: UserId) -> Result<u64, DeliveryError> {
        Ok(self.store.mark_read(reader, peer).await?)
    }

    /// Other users in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_users_except(&self, user: UserId) -> Result<Vec<User>, DeliveryError> {
        Ok(self.store.list_users_except(user).await?)
    }

    /// Record `user` online through `handle`, register it and announce it.
    ///
    /// Registration changes for one user are serialized on this process, so
    /// the registry entry always belongs to the connection whose token the
    /// store holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is unknown or the store fails. In that
    /// case the registry is untouched and nothing is broadcast.
    pub async fn register_user(
        &self,
        handle: &ConnectionHandle,
        user: UserId,
    ) -> Result<(), DeliveryError> {
        let _registration = self.registry.lock_user(user).await;

        self.store
            .set_user_online_status(
                user,
                OnlineStatus::Online {
                    connection: handle.id().clone(),
                },
            )
            .await?;

        self.registry.register(user, handle.clone());
        self.broadcast(Some(handle.id()), ServerFrame::status_changed(user, true, None))
            .await;

        Ok(())
    }

    /// Undo a registration made through `connection`.
    ///
    /// Returns `true` if the user was recorded and announced offline. A
    /// connection that was superseded by a newer registration, here or on
    /// another process, changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Nothing is broadcast then.
    pub async fn unregister_user(
        &self,
        connection: &ConnectionId,
        user: UserId,
    ) -> Result<bool, DeliveryError> {
        let _registration = self.registry.lock_user(user).await;

        if !self.registry.unregister(user, connection) {
            return Ok(false);
        }

        let last_seen = Utc::now();
        let applied = self
            .store
            .set_user_online_status(
                user,
                OnlineStatus::Offline {
                    connection: connection.clone(),
                    last_seen,
                },
            )
            .await?;

        if !applied {
            debug!(user = %user, connection = %connection, "Offline superseded in store");
            return Ok(false);
        }

        self.broadcast(
            Some(connection),
            ServerFrame::status_changed(user, false, Some(last_seen)),
        )
        .await;

        Ok(true)
    }

    /// Forward a typing signal from `sender` to `receiver`.
    pub async fn relay_typing(&self, sender: UserId, receiver: UserId, is_typing: bool) -> DeliveryOutcome {
        self.deliver_to_user(
            receiver,
            ServerFrame::Typing {
                user_id: sender,
                is_typing,
            },
        )
        .await
    }

    /// Deliver a frame to one user, locally if possible, else via the bridge.
    pub async fn deliver_to_user(&self, user: UserId, frame: ServerFrame) -> DeliveryOutcome {
        let frame = Arc::new(frame);

        if let Some(handle) = self.registry.lookup(user) {
            if handle.send(Arc::clone(&frame)) {
                trace!(user = %user, event = frame.event_name(), "Delivered locally");
                return DeliveryOutcome::Local;
            }
        }

        if !self.bridge.is_distributed() {
            return DeliveryOutcome::Dropped;
        }

        let envelope = Envelope::to_user(self.node_id, user, (*frame).clone());
        match self.bridge.publish(envelope).await {
            Ok(()) => DeliveryOutcome::Forwarded,
            Err(e) => {
                warn!(user = %user, error = %e, "Fanout publish failed");
                DeliveryOutcome::Dropped
            }
        }
    }

    /// Send a frame to every connection of every process.
    ///
    /// Returns the number of local connections reached.
    pub async fn broadcast(&self, origin: Option<&ConnectionId>, frame: ServerFrame) -> usize {
        let frame = Arc::new(frame);
        let reached = self.registry.broadcast(&frame, None);

        if self.bridge.is_distributed() {
            let envelope = Envelope::to_all(self.node_id, origin.cloned(), (*frame).clone());
            if let Err(e) = self.bridge.publish(envelope).await {
                warn!(event = frame.event_name(), error = %e, "Fanout publish failed");
            }
        }

        reached
    }

    /// Hand an envelope from another process to local connections.
    ///
    /// Returns the number of local connections reached.
    pub fn dispatch_remote(&self, envelope: Envelope) -> usize {
        if envelope.origin == self.node_id {
            return 0;
        }

        let frame = Arc::new(envelope.frame);
        match envelope.target {
            Target::User { user_id } => match self.registry.lookup(user_id) {
                Some(handle) => usize::from(handle.send(frame)),
                None => 0,
            },
            Target::All => self
                .registry
                .broadcast(&frame, envelope.origin_connection.as_ref()),
        }
    }

    /// Start feeding envelopes from the bridge into [`Self::dispatch_remote`].
    pub fn spawn_bridge_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bridge.subscribe();
        let router = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        router.dispatch_remote(envelope);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fanout listener lagged, envelopes lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(node = %router.node_id, "Fanout listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_fanout::{LocalBridge, MemoryHub};
    use courier_store::SqliteStore;

    async fn router_with(bridge: Arc<dyn FanoutBridge>) -> (Arc<DeliveryRouter>, UserId, UserId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.create_user("alice", "alice@example.com").await.unwrap().id;
        let bob = store.create_user("bob", "bob@example.com").await.unwrap().id;
        let router = DeliveryRouter::new(Arc::new(PresenceRegistry::new()), Arc::new(store), bridge);
        (Arc::new(router), alice, bob)
    }

    #[tokio::test]
    async fn test_offline_receiver_without_bridge_is_dropped() {
        let (router, alice, bob) = router_with(Arc::new(LocalBridge::new())).await;
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::generate());

        let (message, outcome) = router.send_message(&handle, alice, bob, "hi").await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert_eq!(
            *rx.try_recv().unwrap(),
            ServerFrame::MessageConfirmed(message)
        );
    }

    #[tokio::test]
    async fn test_offline_receiver_with_bridge_is_forwarded() {
        let hub = MemoryHub::new();
        let (router, alice, bob) = router_with(Arc::new(hub.bridge())).await;
        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::generate());

        let (_, outcome) = router.send_message(&handle, alice, bob, "hi").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Forwarded);
    }

    #[tokio::test]
    async fn test_own_envelopes_are_ignored() {
        let (router, alice, _) = router_with(Arc::new(LocalBridge::new())).await;
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::generate());
        router.registry().attach(handle.clone());
        router.registry().register(alice, handle);

        let own = Envelope::to_user(router.node_id(), alice, ServerFrame::pong(None));
        assert_eq!(router.dispatch_remote(own), 0);

        let foreign = Envelope::to_user(NodeId::generate(), alice, ServerFrame::pong(None));
        assert_eq!(router.dispatch_remote(foreign), 1);
        assert_eq!(*rx.try_recv().unwrap(), ServerFrame::pong(None));
    }

    #[tokio::test]
    async fn test_remote_broadcast_skips_origin_connection() {
        let (router, _, _) = router_with(Arc::new(LocalBridge::new())).await;
        let (h1, mut rx1) = ConnectionHandle::channel(ConnectionId::generate());
        let (h2, mut rx2) = ConnectionHandle::channel(ConnectionId::generate());
        router.registry().attach(h1.clone());
        router.registry().attach(h2);

        let envelope = Envelope::to_all(
            NodeId::generate(),
            Some(h1.id().clone()),
            ServerFrame::status_changed(UserId(1), true, None),
        );

        assert_eq!(router.dispatch_remote(envelope), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_typing_to_unreachable_peer_is_dropped() {
        let (router, alice, bob) = router_with(Arc::new(LocalBridge::new())).await;
        assert_eq!(
            router.relay_typing(alice, bob, true).await,
            DeliveryOutcome::Dropped
        );
    }
}
