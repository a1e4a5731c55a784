//! Frame types for the Courier protocol.
//!
//! Frames are the fundamental unit of communication between a client and
//! a server. Both directions are internally tagged by `event`, so a JSON
//! frame looks like `{"event":"sendMessage","senderId":1,...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConnectionId, Message, UserId};

/// Error codes carried by `ack` and `error` frames.
pub mod codes {
    pub const MALFORMED_FRAME: u16 = 1001;
    pub const VALIDATION: u16 = 1002;
    pub const NOT_FOUND: u16 = 1003;
    pub const UNAUTHORIZED: u16 = 1004;
    pub const INVALID_STATE: u16 = 1005;
    pub const STORE_UNAVAILABLE: u16 = 1006;
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Bind this connection to a user identity.
    #[serde(rename_all = "camelCase")]
    Register {
        /// Request ID echoed in the ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        user_id: UserId,
    },

    /// Send a direct message.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    },

    /// Fetch the conversation between two users.
    #[serde(rename_all = "camelCase")]
    GetMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        user_id1: UserId,
        user_id2: UserId,
    },

    /// Typing indicator addressed to one peer.
    #[serde(rename_all = "camelCase")]
    Typing {
        receiver_id: UserId,
        is_typing: bool,
    },

    /// Mark every message from `user_id` to the registered user as read.
    #[serde(rename_all = "camelCase")]
    MarkRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        user_id: UserId,
    },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// The event name, for logging and metrics.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::Register { .. } => "register",
            ClientFrame::SendMessage { .. } => "sendMessage",
            ClientFrame::GetMessages { .. } => "getMessages",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::MarkRead { .. } => "markRead",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// The request ID, if the frame carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientFrame::Register { id, .. }
            | ClientFrame::SendMessage { id, .. }
            | ClientFrame::GetMessages { id, .. }
            | ClientFrame::MarkRead { id, .. } => *id,
            ClientFrame::Typing { .. } | ClientFrame::Ping { .. } => None,
        }
    }
}

/// Outcome reported in an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckStatus {
    Registered,
    Sent,
    Success,
    Error,
}

/// Response to a client request.
///
/// Only the fields relevant to `status` are present on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl Ack {
    fn empty(id: Option<u64>, status: AckStatus) -> Self {
        Self {
            id,
            status,
            user_id: None,
            message: None,
            messages: None,
            count: None,
            error: None,
            code: None,
        }
    }

    /// `{status: registered, userId}`
    #[must_use]
    pub fn registered(id: Option<u64>, user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::empty(id, AckStatus::Registered)
        }
    }

    /// `{status: sent, message}`
    #[must_use]
    pub fn sent(id: Option<u64>, message: Message) -> Self {
        Self {
            message: Some(message),
            ..Self::empty(id, AckStatus::Sent)
        }
    }

    /// `{status: success, messages}`
    #[must_use]
    pub fn messages(id: Option<u64>, messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::empty(id, AckStatus::Success)
        }
    }

    /// `{status: success, count}`
    #[must_use]
    pub fn count(id: Option<u64>, count: u64) -> Self {
        Self {
            count: Some(count),
            ..Self::empty(id, AckStatus::Success)
        }
    }

    /// `{status: error, error, code}`
    #[must_use]
    pub fn error(id: Option<u64>, code: u16, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            code: Some(code),
            ..Self::empty(id, AckStatus::Error)
        }
    }

    /// Whether this ack reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == AckStatus::Error
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Connection established.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: ConnectionId,
        /// Protocol major version.
        version: u8,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Response to a client request.
    Ack(Ack),

    /// A message addressed to this connection's user.
    NewMessage(Message),

    /// A message this connection sent has been persisted.
    MessageConfirmed(Message),

    /// A user came online or went offline.
    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },

    /// A peer started or stopped typing.
    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId, is_typing: bool },

    /// A frame could not be processed at all.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: u16,
        message: String,
    },

    /// Keepalive reply.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// The event name, for logging and metrics.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Ack(_) => "ack",
            ServerFrame::NewMessage(_) => "newMessage",
            ServerFrame::MessageConfirmed(_) => "messageConfirmed",
            ServerFrame::UserStatusChanged { .. } => "userStatusChanged",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: ConnectionId, version: u8, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            connection_id,
            version,
            heartbeat,
        }
    }

    /// Create a presence change frame.
    #[must_use]
    pub fn status_changed(
        user_id: UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Self {
        ServerFrame::UserStatusChanged {
            user_id,
            is_online,
            last_seen,
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: Option<u64>, code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageId;
    use serde_json::json;

    fn sample_message() -> Message {
        Message {
            id: MessageId(1),
            sender_id: UserId(1),
            receiver_id: UserId(2),
            content: "hi".into(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    #[test]
    fn test_client_frame_from_json() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "sendMessage",
            "id": 4,
            "senderId": 1,
            "receiverId": 2,
            "content": "hi"
        }))
        .unwrap();

        assert_eq!(
            frame,
            ClientFrame::SendMessage {
                id: Some(4),
                sender_id: UserId(1),
                receiver_id: UserId(2),
                content: "hi".into(),
            }
        );
        assert_eq!(frame.request_id(), Some(4));
        assert_eq!(frame.event_name(), "sendMessage");
    }

    #[test]
    fn test_get_messages_field_names() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "getMessages",
            "userId1": 1,
            "userId2": 2
        }))
        .unwrap();

        assert!(matches!(
            frame,
            ClientFrame::GetMessages {
                id: None,
                user_id1: UserId(1),
                user_id2: UserId(2)
            }
        ));
    }

    #[test]
    fn test_ack_shapes() {
        let registered = serde_json::to_value(ServerFrame::Ack(Ack::registered(
            Some(1),
            UserId(9),
        )))
        .unwrap();
        assert_eq!(
            registered,
            json!({"event": "ack", "id": 1, "status": "registered", "userId": 9})
        );

        let error =
            serde_json::to_value(ServerFrame::Ack(Ack::error(None, codes::VALIDATION, "empty")))
                .unwrap();
        assert_eq!(error["status"], "error");
        assert_eq!(error["error"], "empty");
        assert_eq!(error["code"], 1002);
        assert!(error.get("message").is_none());

        assert!(Ack::error(None, codes::VALIDATION, "empty").is_error());
        assert!(!Ack::registered(None, UserId(9)).is_error());
    }

    #[test]
    fn test_new_message_is_flat() {
        let value = serde_json::to_value(ServerFrame::NewMessage(sample_message())).unwrap();
        assert_eq!(value["event"], "newMessage");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["senderId"], 1);
    }

    #[test]
    fn test_status_changed_omits_last_seen_when_online() {
        let value =
            serde_json::to_value(ServerFrame::status_changed(UserId(2), true, None)).unwrap();
        assert_eq!(
            value,
            json!({"event": "userStatusChanged", "userId": 2, "isOnline": true})
        );
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = serde_json::from_value::<ClientFrame>(json!({"event": "subscribe"}));
        assert!(result.is_err());
    }
}
