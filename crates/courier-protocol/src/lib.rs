//! # courier-protocol
//!
//! Wire protocol definitions for the Courier direct-messaging engine.
//!
//! This crate defines the frames exchanged between Courier clients and
//! servers, the records they carry, and the codecs used to put them on the
//! wire.
//!
//! ## Frames
//!
//! - `register` / `sendMessage` / `getMessages` / `typing` / `markRead` - client requests
//! - `ack` - responses to requests
//! - `newMessage` / `messageConfirmed` / `userStatusChanged` / `typing` - server pushes
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientFrame, UserId};
//!
//! let frame = ClientFrame::SendMessage {
//!     id: Some(1),
//!     sender_id: UserId(1),
//!     receiver_id: UserId(2),
//!     content: "hi".into(),
//! };
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod models;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, Ack, AckStatus, ClientFrame, ServerFrame};
pub use models::{ConnectionId, Message, MessageId, NodeId, User, UserId};
pub use version::{Version, PROTOCOL_VERSION};
