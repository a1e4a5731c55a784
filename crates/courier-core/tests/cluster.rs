//! Two server processes joined by an in-memory fanout hub.

mod common;

use common::{ack, node, seeded_store, Client, Users};
use courier_core::{DeliveryOutcome, DeliveryRouter};
use courier_fanout::MemoryHub;
use courier_protocol::{AckStatus, ClientFrame, ServerFrame};
use courier_store::{MessageStore, SqliteStore};
use std::sync::Arc;

struct Cluster {
    store: SqliteStore,
    users: Users,
    a: Arc<DeliveryRouter>,
    b: Arc<DeliveryRouter>,
}

async fn cluster() -> Cluster {
    let (store, users) = seeded_store().await;
    let hub = MemoryHub::new();

    let a = node(Arc::new(store.clone()), Arc::new(hub.bridge()));
    let b = node(Arc::new(store.clone()), Arc::new(hub.bridge()));
    a.spawn_bridge_listener();
    b.spawn_bridge_listener();

    Cluster { store, users, a, b }
}

#[tokio::test]
async fn message_reaches_receiver_on_other_node() {
    let c = cluster().await;
    let mut alice = Client::connect(&c.a);
    let mut bob = Client::connect(&c.b);
    alice.register(c.users.alice).await;
    bob.register(c.users.bob).await;

    let reply = alice.send(c.users.bob, "across").await;
    assert_eq!(reply.delivery, Some(DeliveryOutcome::Forwarded));
    assert_eq!(ack(reply).status, AckStatus::Sent);

    let delivered = bob
        .expect(|f| matches!(f, ServerFrame::NewMessage(_)))
        .await;
    match delivered {
        ServerFrame::NewMessage(m) => {
            assert_eq!(m.content, "across");
            assert_eq!(m.receiver_id, c.users.bob);
        }
        other => panic!("unexpected {:?}", other),
    }

    alice
        .expect(|f| matches!(f, ServerFrame::MessageConfirmed(m) if m.content == "across"))
        .await;
}

#[tokio::test]
async fn presence_crosses_nodes() {
    let c = cluster().await;
    let mut alice = Client::connect(&c.a);
    alice.register(c.users.alice).await;

    let mut bob = Client::connect(&c.b);
    bob.register(c.users.bob).await;

    let bob_id = c.users.bob;
    alice
        .expect(|f| {
            matches!(f, ServerFrame::UserStatusChanged { user_id, is_online: true, .. } if *user_id == bob_id)
        })
        .await;

    assert!(bob.session.close().await);
    alice
        .expect(|f| {
            matches!(
                f,
                ServerFrame::UserStatusChanged { user_id, is_online: false, last_seen: Some(_) }
                    if *user_id == bob_id
            )
        })
        .await;
}

#[tokio::test]
async fn typing_crosses_nodes() {
    let c = cluster().await;
    let mut alice = Client::connect(&c.a);
    let mut bob = Client::connect(&c.b);
    alice.register(c.users.alice).await;
    bob.register(c.users.bob).await;

    let reply = alice
        .request(ClientFrame::Typing {
            receiver_id: c.users.bob,
            is_typing: true,
        })
        .await;
    assert_eq!(reply.delivery, Some(DeliveryOutcome::Forwarded));

    let alice_id = c.users.alice;
    bob.expect(|f| {
        matches!(f, ServerFrame::Typing { user_id, is_typing: true } if *user_id == alice_id)
    })
    .await;
}

#[tokio::test]
async fn stale_disconnect_on_old_node_keeps_user_online() {
    let c = cluster().await;

    let mut old = Client::connect(&c.a);
    old.register(c.users.bob).await;

    // Bob reconnects through the other process.
    let mut new = Client::connect(&c.b);
    new.register(c.users.bob).await;

    // Node A still maps bob to the old connection, so its registry entry
    // goes away, but the store refuses the stale offline write.
    assert!(!old.session.close().await);
    assert!(c.a.registry().lookup(c.users.bob).is_none());
    assert!(c.b.registry().lookup(c.users.bob).is_some());

    let stored = c.store.get_user(c.users.bob).await.unwrap().unwrap();
    assert!(stored.is_online);
}
