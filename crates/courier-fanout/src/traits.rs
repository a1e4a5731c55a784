//! Bridge abstraction for Courier.
//!
//! A bridge carries [`Envelope`]s between server processes. Every process
//! publishes what it cannot deliver locally and re-emits what it receives
//! to its own connections.

use async_trait::async_trait;
use courier_protocol::{ConnectionId, NodeId, ProtocolError, ServerFrame, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Who an envelope is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Target {
    /// The connection of one user, wherever it lives.
    #[serde(rename_all = "camelCase")]
    User { user_id: UserId },
    /// Every connection on every process.
    All,
}

impl Target {
    /// The event class, used to key the shared channel.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            Target::User { .. } => ChannelKind::Deliver,
            Target::All => ChannelKind::Broadcast,
        }
    }
}

/// Event classes, each carried on its own shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Deliver,
    Broadcast,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Deliver, ChannelKind::Broadcast];

    /// Channel suffix.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Deliver => "deliver",
            ChannelKind::Broadcast => "broadcast",
        }
    }
}

/// Shared channel name for an event class, e.g. `courier:deliver`.
#[must_use]
pub fn channel_name(prefix: &str, kind: ChannelKind) -> String {
    format!("{}:{}", prefix, kind.as_str())
}

/// A server frame travelling between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Process that published the envelope.
    pub origin: NodeId,
    /// Connection that caused the event, never delivered back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_connection: Option<ConnectionId>,
    pub target: Target,
    pub frame: ServerFrame,
}

impl Envelope {
    /// Address a frame to one user.
    #[must_use]
    pub fn to_user(origin: NodeId, user_id: UserId, frame: ServerFrame) -> Self {
        Self {
            origin,
            origin_connection: None,
            target: Target::User { user_id },
            frame,
        }
    }

    /// Address a frame to everyone.
    #[must_use]
    pub fn to_all(origin: NodeId, origin_connection: Option<ConnectionId>, frame: ServerFrame) -> Self {
        Self {
            origin,
            origin_connection,
            target: Target::All,
            frame,
        }
    }
}

/// Fanout errors.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The shared channel could not be reached.
    #[error("Fanout unavailable: {0}")]
    Unavailable(String),

    /// Envelope could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A publish/subscribe layer shared by all server processes.
#[async_trait]
pub trait FanoutBridge: Send + Sync {
    /// Publish an envelope to every subscribed process.
    async fn publish(&self, envelope: Envelope) -> Result<(), FanoutError>;

    /// Receive envelopes published by any process, including this one.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Get the bridge name (e.g. "redis", "local").
    fn name(&self) -> &'static str;

    /// Whether other processes can be reached through this bridge.
    fn is_distributed(&self) -> bool {
        true
    }

    /// Check if the bridge is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_keyed_by_event_class() {
        assert_eq!(channel_name("courier", ChannelKind::Deliver), "courier:deliver");
        assert_eq!(
            channel_name("courier", Target::All.kind()),
            "courier:broadcast"
        );
    }

    #[test]
    fn test_envelope_survives_codec() {
        let envelope = Envelope::to_user(
            NodeId::generate(),
            UserId(2),
            ServerFrame::Typing {
                user_id: UserId(1),
                is_typing: true,
            },
        );

        let encoded = courier_protocol::codec::encode(&envelope).unwrap();
        let decoded: Envelope = courier_protocol::codec::decode(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }
}
