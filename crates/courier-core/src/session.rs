//! Per-connection session state machine.
//!
//! ```text
//! Connecting ──register──▶ Registered ──any request──▶ Active
//!      │                        │                        │
//!      └────────────────────────┴──── disconnect ───────▶ Closed
//! ```
//!
//! A session handles one frame at a time, so a connection's requests are
//! processed in the order they arrived.

use crate::error::DeliveryError;
use crate::registry::ConnectionHandle;
use crate::router::{DeliveryOutcome, DeliveryRouter};
use courier_protocol::{codes, Ack, ClientFrame, ConnectionId, ServerFrame, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `register`.
    Connecting,
    /// Registered, no request handled yet.
    Registered,
    /// Registered and serving requests.
    Active,
    /// Transport gone, cleanup done.
    Closed,
}

/// Result of handling one client frame.
#[derive(Debug, Default)]
pub struct Reply {
    /// Frame to queue back on this connection, after anything the handler
    /// already queued.
    pub frame: Option<ServerFrame>,
    /// Where a `newMessage` or `typing` went, if one was routed.
    pub delivery: Option<DeliveryOutcome>,
}

impl Reply {
    fn frame(frame: ServerFrame) -> Self {
        Self {
            frame: Some(frame),
            delivery: None,
        }
    }

    fn ack(ack: Ack) -> Self {
        Self::frame(ServerFrame::Ack(ack))
    }
}

/// One client connection.
pub struct Session {
    router: Arc<DeliveryRouter>,
    handle: ConnectionHandle,
    /// Identity proven at upgrade, if any.
    identity: Option<UserId>,
    user: Option<UserId>,
    state: SessionState,
}

impl Session {
    /// Attach a new connection. It receives broadcasts from now on.
    pub fn new(router: Arc<DeliveryRouter>, handle: ConnectionHandle, identity: Option<UserId>) -> Self {
        router.registry().attach(handle.clone());
        debug!(connection = %handle.id(), identity = ?identity, "Session opened");

        Self {
            router,
            handle,
            identity,
            user: None,
            state: SessionState::Connecting,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The registered user.
    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.handle.id()
    }

    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Handle one client frame.
    ///
    /// Failures become an error ack. They never close the session.
    pub async fn handle_frame(&mut self, frame: ClientFrame) -> Reply {
        let request_id = frame.request_id();

        if self.state == SessionState::Closed {
            return Reply::ack(Ack::error(request_id, codes::INVALID_STATE, "Session closed"));
        }

        match frame {
            ClientFrame::Ping { timestamp } => Reply::frame(ServerFrame::pong(timestamp)),
            ClientFrame::Register { id, user_id } => Reply::ack(self.register(id, user_id).await),
            other => {
                let Some(user) = self.user else {
                    return Reply::ack(Ack::error(
                        request_id,
                        codes::INVALID_STATE,
                        "Register before sending requests",
                    ));
                };
                self.state = SessionState::Active;
                self.dispatch(user, other).await
            }
        }
    }

    async fn register(&mut self, id: Option<u64>, user_id: UserId) -> Ack {
        if self.identity.is_some_and(|identity| identity != user_id) {
            warn!(
                connection = %self.handle.id(),
                user = %user_id,
                "Register for a user other than the authenticated one"
            );
            return error_ack(id, &DeliveryError::Unauthorized);
        }

        match self.user {
            Some(current) if current == user_id => return Ack::registered(id, user_id),
            Some(_) => {
                return error_ack(
                    id,
                    &DeliveryError::InvalidState("Connection already registered as another user"),
                )
            }
            None => {}
        }

        match self.router.register_user(&self.handle, user_id).await {
            Ok(()) => {
                self.user = Some(user_id);
                self.state = SessionState::Registered;
                info!(connection = %self.handle.id(), user = %user_id, "User registered");
                Ack::registered(id, user_id)
            }
            Err(e) => {
                warn!(
                    connection = %self.handle.id(),
                    user = %user_id,
                    kind = e.kind(),
                    error = %e,
                    "Registration failed"
                );
                error_ack(id, &e)
            }
        }
    }

    async fn dispatch(&mut self, user: UserId, frame: ClientFrame) -> Reply {
        match frame {
            ClientFrame::SendMessage {
                id,
                sender_id,
                receiver_id,
                content,
            } => {
                if sender_id != user {
                    return Reply::ack(error_ack(
                        id,
                        &DeliveryError::Validation("senderId does not match registered user".into()),
                    ));
                }

                match self
                    .router
                    .send_message(&self.handle, user, receiver_id, &content)
                    .await
                {
                    Ok((message, outcome)) => Reply {
                        frame: Some(ServerFrame::Ack(Ack::sent(id, message))),
                        delivery: Some(outcome),
                    },
                    Err(e) => {
                        debug!(user = %user, receiver = %receiver_id, error = %e, "sendMessage failed");
                        Reply::ack(error_ack(id, &e))
                    }
                }
            }

            ClientFrame::GetMessages {
                id,
                user_id1,
                user_id2,
            } => {
                if user != user_id1 && user != user_id2 {
                    return Reply::ack(error_ack(id, &DeliveryError::Unauthorized));
                }

                match self.router.messages_between(user_id1, user_id2).await {
                    Ok(messages) => Reply::ack(Ack::messages(id, messages)),
                    Err(e) => Reply::ack(error_ack(id, &e)),
                }
            }

            ClientFrame::MarkRead { id, user_id } => match self.router.mark_read(user, user_id).await {
                Ok(count) => Reply::ack(Ack::count(id, count)),
                Err(e) => Reply::ack(error_ack(id, &e)),
            },

            ClientFrame::Typing {
                receiver_id,
                is_typing,
            } => Reply {
                frame: None,
                delivery: Some(self.router.relay_typing(user, receiver_id, is_typing).await),
            },

            ClientFrame::Register { .. } | ClientFrame::Ping { .. } => Reply::default(),
        }
    }

    /// Tear the session down after the transport went away.
    ///
    /// Returns `true` if the user was announced offline. Calling it again
    /// does nothing.
    pub async fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.router.registry().detach(self.handle.id());

        let Some(user) = self.user else {
            debug!(connection = %self.handle.id(), "Unregistered session closed");
            return false;
        };

        match self.router.unregister_user(self.handle.id(), user).await {
            Ok(announced) => {
                info!(connection = %self.handle.id(), user = %user, announced, "Session closed");
                announced
            }
            Err(e) => {
                warn!(
                    connection = %self.handle.id(),
                    user = %user,
                    kind = e.kind(),
                    error = %e,
                    "Failed to record offline"
                );
                false
            }
        }
    }
}

fn error_ack(id: Option<u64>, err: &DeliveryError) -> Ack {
    Ack::error(id, err.code(), err.to_string())
}
