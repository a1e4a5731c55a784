//! Bridge selection with fallback.
//!
//! The configured shared channel is preferred. When none is configured
//! the process runs single-instance. When one is configured but cannot be
//! reached the process keeps serving its own connections and reports
//! itself degraded.

use std::sync::Arc;

use tracing::{info, warn};

use crate::local::LocalBridge;
use crate::traits::FanoutBridge;

/// Inputs to [`connect_bridge`].
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub redis_url: Option<String>,
    pub channel_prefix: String,
    pub capacity: usize,
}

/// How the selected bridge relates to the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    /// Connected to the configured shared channel.
    Distributed,
    /// No shared channel configured.
    SingleInstance,
    /// A shared channel was configured but is unreachable.
    Degraded,
}

impl FanoutMode {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, FanoutMode::Degraded)
    }
}

/// Pick the best available bridge for the given settings.
pub async fn connect_bridge(settings: &FanoutSettings) -> (Arc<dyn FanoutBridge>, FanoutMode) {
    let Some(url) = settings.redis_url.as_deref() else {
        info!("No fanout configured, running single-instance");
        return (Arc::new(LocalBridge::new()), FanoutMode::SingleInstance);
    };

    connect_redis(url, settings).await
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str, settings: &FanoutSettings) -> (Arc<dyn FanoutBridge>, FanoutMode) {
    use crate::redis::{RedisBridge, RedisBridgeConfig};

    let config = RedisBridgeConfig {
        url: url.to_string(),
        channel_prefix: settings.channel_prefix.clone(),
        capacity: settings.capacity,
    };

    match RedisBridge::connect(config).await {
        Ok(bridge) => (Arc::new(bridge), FanoutMode::Distributed),
        Err(e) => {
            warn!(
                url = %url,
                error = %e,
                "Fanout unreachable, falling back to local delivery only"
            );
            (Arc::new(LocalBridge::new()), FanoutMode::Degraded)
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(url: &str, _settings: &FanoutSettings) -> (Arc<dyn FanoutBridge>, FanoutMode) {
    warn!(
        url = %url,
        "Built without redis support, falling back to local delivery only"
    );
    (Arc::new(LocalBridge::new()), FanoutMode::Degraded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(redis_url: Option<&str>) -> FanoutSettings {
        FanoutSettings {
            redis_url: redis_url.map(String::from),
            channel_prefix: "courier-test".into(),
            capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_no_url_runs_single_instance() {
        let (bridge, mode) = connect_bridge(&settings(None)).await;
        assert_eq!(mode, FanoutMode::SingleInstance);
        assert_eq!(bridge.name(), "local");
        assert!(!bridge.is_distributed());
    }

    #[tokio::test]
    async fn test_unreachable_url_degrades() {
        // Port 1 is reserved and nothing listens there.
        let (bridge, mode) = connect_bridge(&settings(Some("redis://127.0.0.1:1/"))).await;
        assert!(mode.is_degraded());
        assert_eq!(bridge.name(), "local");
    }

    #[tokio::test]
    async fn test_invalid_url_degrades() {
        let (_, mode) = connect_bridge(&settings(Some("not a url"))).await;
        assert!(mode.is_degraded());
    }
}
