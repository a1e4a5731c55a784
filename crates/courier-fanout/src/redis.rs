//! Redis pub/sub bridge.
//!
//! Envelopes are MessagePack-encoded and published on one channel per
//! event class. Every process subscribes to all of them, including the
//! ones it publishes to, and filters its own envelopes by origin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_protocol::codec;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::{channel_name, ChannelKind, Envelope, FanoutBridge, FanoutError};

impl From<redis::RedisError> for FanoutError {
    fn from(err: redis::RedisError) -> Self {
        FanoutError::Unavailable(err.to_string())
    }
}

/// Redis bridge configuration.
#[derive(Debug, Clone)]
pub struct RedisBridgeConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Channel name prefix.
    pub channel_prefix: String,
    /// Capacity of the local re-emit channel.
    pub capacity: usize,
}

/// Bridge backed by Redis PUBLISH/SUBSCRIBE.
pub struct RedisBridge {
    publisher: MultiplexedConnection,
    channel_prefix: String,
    sender: broadcast::Sender<Envelope>,
    healthy: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl RedisBridge {
    /// Connect, subscribe to every event channel and start listening.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(config: RedisBridgeConfig) -> Result<Self, FanoutError> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = client.get_multiplexed_async_connection().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        for kind in ChannelKind::ALL {
            pubsub
                .subscribe(channel_name(&config.channel_prefix, kind))
                .await?;
        }

        let (sender, _) = broadcast::channel(config.capacity);
        let healthy = Arc::new(AtomicBool::new(true));
        let listener = tokio::spawn(listen(pubsub, sender.clone(), healthy.clone()));

        info!(
            url = %config.url,
            prefix = %config.channel_prefix,
            "Connected to Redis fanout"
        );

        Ok(Self {
            publisher,
            channel_prefix: config.channel_prefix,
            sender,
            healthy,
            listener,
        })
    }
}

async fn listen(pubsub: PubSub, sender: broadcast::Sender<Envelope>, healthy: Arc<AtomicBool>) {
    let mut messages = Box::pin(pubsub.into_on_message());

    while let Some(msg) = messages.next().await {
        let payload: Vec<u8> = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = msg.get_channel_name(), error = %e, "Unreadable fanout payload");
                continue;
            }
        };

        match codec::decode::<Envelope>(&payload) {
            Ok(envelope) => {
                // Nobody listening yet is fine.
                let _ = sender.send(envelope);
            }
            Err(e) => {
                warn!(channel = msg.get_channel_name(), error = %e, "Dropping malformed envelope");
            }
        }
    }

    healthy.store(false, Ordering::Relaxed);
    warn!("Redis subscription ended, remote events will no longer arrive");
}

impl Drop for RedisBridge {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl FanoutBridge for RedisBridge {
    async fn publish(&self, envelope: Envelope) -> Result<(), FanoutError> {
        let channel = channel_name(&self.channel_prefix, envelope.target.kind());
        let payload = codec::encode(&envelope)?;

        let mut conn = self.publisher.clone();
        let _: () = conn.publish(&channel, payload.to_vec()).await?;

        debug!(channel = %channel, event = envelope.frame.event_name(), "Published envelope");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
