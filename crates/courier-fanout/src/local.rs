//! Single-instance bridge.
//!
//! Nothing leaves the process and nothing arrives. Used when no shared
//! channel is configured or the configured one could not be reached.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::traits::{Envelope, FanoutBridge, FanoutError};

/// A bridge that reaches no other process.
pub struct LocalBridge {
    // Kept alive so subscribers wait instead of observing a closed channel.
    sender: broadcast::Sender<Envelope>,
}

impl LocalBridge {
    /// Create a local-only bridge.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }
}

impl Default for LocalBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBridge for LocalBridge {
    async fn publish(&self, _envelope: Envelope) -> Result<(), FanoutError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}
