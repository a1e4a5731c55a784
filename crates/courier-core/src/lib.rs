//! # courier-core
//!
//! The presence-aware delivery engine behind Courier.
//!
//! - **Registry** - which user is reachable through which local connection
//! - **Router** - persist, then deliver locally or through the fanout bridge
//! - **Session** - per-connection state machine and request handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!               ┌──────────┐   ┌─────────────┐
//!               │ Registry │   │   Bridge    │
//!               └──────────┘   └─────────────┘
//! ```

pub mod error;
pub mod registry;
pub mod router;
pub mod session;

pub use error::DeliveryError;
pub use registry::{ConnectionHandle, PresenceRegistry, RegistryStats};
pub use router::{DeliveryOutcome, DeliveryRouter};
pub use session::{Reply, Session, SessionState};
