//! Shared harness for session scenario tests.

#![allow(dead_code)]

use courier_core::{ConnectionHandle, DeliveryRouter, PresenceRegistry, Reply, Session};
use courier_fanout::FanoutBridge;
use courier_protocol::{Ack, ClientFrame, ConnectionId, ServerFrame, UserId};
use courier_store::{MessageStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Users {
    pub alice: UserId,
    pub bob: UserId,
    pub carol: UserId,
}

/// An in-memory store with three users.
pub async fn seeded_store() -> (SqliteStore, Users) {
    let store = SqliteStore::open_in_memory().unwrap();
    let alice = store.create_user("alice", "alice@example.com").await.unwrap().id;
    let bob = store.create_user("bob", "bob@example.com").await.unwrap().id;
    let carol = store.create_user("carol", "carol@example.com").await.unwrap().id;
    (store, Users { alice, bob, carol })
}

/// One simulated server process.
pub fn node(store: Arc<dyn MessageStore>, bridge: Arc<dyn FanoutBridge>) -> Arc<DeliveryRouter> {
    Arc::new(DeliveryRouter::new(
        Arc::new(PresenceRegistry::new()),
        store,
        bridge,
    ))
}

/// A client connection driving a session directly.
pub struct Client {
    pub session: Session,
    pub rx: UnboundedReceiver<Arc<ServerFrame>>,
}

impl Client {
    pub fn connect(router: &Arc<DeliveryRouter>) -> Self {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::generate());
        Self {
            session: Session::new(Arc::clone(router), handle, None),
            rx,
        }
    }

    pub async fn request(&mut self, frame: ClientFrame) -> Reply {
        self.session.handle_frame(frame).await
    }

    pub async fn register(&mut self, user_id: UserId) -> Ack {
        ack(self.request(ClientFrame::Register { id: None, user_id }).await)
    }

    pub async fn send(&mut self, receiver_id: UserId, content: &str) -> Reply {
        let sender_id = self.session.user().unwrap();
        self.request(ClientFrame::SendMessage {
            id: Some(1),
            sender_id,
            receiver_id,
            content: content.to_string(),
        })
        .await
    }

    /// Everything queued so far.
    pub fn drain(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push((*frame).clone());
        }
        frames
    }

    /// Wait for the next queued frame matching `pred`, skipping others.
    pub async fn expect(&mut self, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
        let wait = async {
            while let Some(frame) = self.rx.recv().await {
                if pred(&frame) {
                    return (*frame).clone();
                }
            }
            panic!("connection queue closed");
        };

        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("timed out waiting for frame")
    }
}

pub fn ack(reply: Reply) -> Ack {
    match reply.frame {
        Some(ServerFrame::Ack(ack)) => ack,
        other => panic!("Expected ack, got {:?}", other),
    }
}

pub fn new_messages(frames: &[ServerFrame]) -> Vec<&ServerFrame> {
    frames
        .iter()
        .filter(|f| matches!(f, ServerFrame::NewMessage(_)))
        .collect()
}

pub fn status_changes(frames: &[ServerFrame], user: UserId) -> Vec<(bool, bool)> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::UserStatusChanged {
                user_id,
                is_online,
                last_seen,
            } if *user_id == user => Some((*is_online, last_seen.is_some())),
            _ => None,
        })
        .collect()
}
