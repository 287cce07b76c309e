use std::sync::Arc;

use stockpulse_core::BridgeError;
use stockpulse_notify::{ListenerHandle, ListenerService, ReconnectPolicy, UpstreamListener};

use crate::broadcast::Broadcaster;

/// Wires the broadcaster to the upstream listener: every decoded change event
/// on `channel` is pushed to all live subscribers.
pub struct EventBridge {
    listener: Arc<UpstreamListener>,
    broadcaster: Arc<Broadcaster>,
}

impl EventBridge {
    pub fn new(listener: Arc<UpstreamListener>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            listener,
            broadcaster,
        }
    }

    /// Register the broadcaster and subscribe to `channel`, then hand the
    /// listener to the supervision loop. Only a failed initial connection is
    /// reported; later connection loss is retried under `policy`.
    pub async fn start(self, channel: &str, policy: ReconnectPolicy) -> Result<ListenerHandle, BridgeError> {
        self.listener.add_listener(self.broadcaster);
        self.listener.listen_to_channel(channel).await?;
        tracing::info!(channel, "event bridge started");
        Ok(ListenerService::start(self.listener, policy))
    }
}
