//! # courier-fanout
//!
//! Cross-process event fanout for Courier.
//!
//! Each server process holds only its own connections. When a frame is
//! addressed to a user connected elsewhere, or must reach everybody, it is
//! published as an [`Envelope`] on a shared channel and every process
//! re-emits it to the connections it holds.
//!
//! ## Bridges
//!
//! - **Redis**: PUBLISH/SUBSCRIBE, one channel per event class
//! - **Memory**: several routers in one process (tests, embedding)
//! - **Local**: single instance, nothing crosses a process boundary
//!
//! ## Features
//!
//! - `redis` (default): Redis pub/sub support

pub mod fallback;
pub mod local;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod traits;

pub use fallback::{connect_bridge, FanoutMode, FanoutSettings};
pub use local::LocalBridge;
pub use memory::{MemoryBridge, MemoryHub};
pub use traits::{channel_name, ChannelKind, Envelope, FanoutBridge, FanoutError, Target};

#[cfg(feature = "redis")]
pub use crate::redis::{RedisBridge, RedisBridgeConfig};
