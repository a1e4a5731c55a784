//! In-process bridge.
//!
//! A [`MemoryHub`] plays the role of the shared channel for several
//! routers living in the same process, e.g. two simulated nodes in a test.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::traits::{Envelope, FanoutBridge, FanoutError};

/// Default hub capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Shared channel joining in-process bridges.
#[derive(Clone)]
pub struct MemoryHub {
    sender: broadcast::Sender<Envelope>,
}

impl MemoryHub {
    /// Create a hub with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a new bridge to this hub.
    #[must_use]
    pub fn bridge(&self) -> MemoryBridge {
        MemoryBridge {
            sender: self.sender.clone(),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A bridge attached to a [`MemoryHub`].
pub struct MemoryBridge {
    sender: broadcast::Sender<Envelope>,
}

#[async_trait]
impl FanoutBridge for MemoryBridge {
    async fn publish(&self, envelope: Envelope) -> Result<(), FanoutError> {
        // No subscribers is not an error, there is just nobody to reach.
        let receivers = self.sender.send(envelope).unwrap_or_default();
        trace!(receivers, "Published envelope to memory hub");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
