use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use stockpulse_core::{BridgeError, ChangeEvent, SubscriberId};
use stockpulse_notify::ChangeHandler;

/// Send side of one subscriber's transport.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), BridgeError>;
}

/// Sink backed by a bounded queue, drained by the subscriber's writer task.
/// A full queue makes `send` wait, which the broadcaster bounds with its
/// send timeout.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, message: &str) -> Result<(), BridgeError> {
        self.tx
            .send(message.to_string())
            .await
            .map_err(|_| BridgeError::SubscriberSend("subscriber queue closed".into()))
    }
}

/// Live endpoint that receives one text message per change event.
#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    sink: Arc<dyn EventSink>,
}

impl Subscriber {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: SubscriberId::new(),
            sink,
        }
    }
}

/// Result of one broadcast pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers in the snapshot the pass sent to.
    pub recipients: usize,
    pub delivered: usize,
    /// Subscribers removed because their send failed or timed out.
    pub removed: Vec<SubscriberId>,
}

/// Registry of live subscribers and fan-out of change events to them.
pub struct Broadcaster {
    live: DashMap<SubscriberId, Subscriber>,
    // Serializes broadcasts so every subscriber sees events in the same order.
    broadcast_lock: Mutex<()>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            live: DashMap::new(),
            broadcast_lock: Mutex::new(()),
            send_timeout,
        }
    }

    /// Add a subscriber whose transport handshake already completed. It
    /// receives every broadcast that starts after this returns.
    pub fn connect(&self, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id.clone();
        self.live.insert(id.clone(), subscriber);
        info!(subscriber_id = %id, subscribers = self.live.len(), "subscriber connected");
        id
    }

    /// Create a queue-backed subscriber, connect it, and hand back the
    /// receiving end of its queue.
    pub fn register(&self, max_send_queue: usize) -> (SubscriberId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue.max(1));
        let id = self.connect(Subscriber::new(Arc::new(ChannelSink::new(tx))));
        (id, rx)
    }

    /// Remove a subscriber. Returns whether it was still live.
    pub fn disconnect(&self, id: &SubscriberId) -> bool {
        let removed = self.live.remove(id).is_some();
        if removed {
            info!(subscriber_id = %id, subscribers = self.live.len(), "subscriber disconnected");
        }
        removed
    }

    /// Drop every subscriber, closing their queues. Used on shutdown.
    pub fn disconnect_all(&self) -> usize {
        let count = self.live.len();
        self.live.clear();
        if count > 0 {
            info!(subscribers = count, "all subscribers disconnected");
        }
        count
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.live.contains_key(id)
    }

    /// Send `event` to every live subscriber. The event is serialized once and
    /// sent concurrently to a snapshot of the live set; subscribers whose send
    /// fails or exceeds the send timeout are removed once the pass is done.
    /// Individual failures are logged, never returned.
    pub async fn broadcast(&self, event: &ChangeEvent) -> BroadcastReport {
        let message = match event.to_wire() {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to serialize change event");
                return BroadcastReport::default();
            }
        };

        let _guard = self.broadcast_lock.lock().await;
        let snapshot: Vec<Subscriber> = self.live.iter().map(|entry| entry.value().clone()).collect();
        if snapshot.is_empty() {
            debug!("no subscribers, broadcast skipped");
            return BroadcastReport::default();
        }

        let sends = snapshot.iter().map(|subscriber| {
            let message = message.as_str();
            async move {
                match tokio::time::timeout(self.send_timeout, subscriber.sink.send(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::SubscriberTimeout(self.send_timeout)),
                }
            }
        });
        let results = futures::future::join_all(sends).await;

        let mut report = BroadcastReport {
            recipients: snapshot.len(),
            ..Default::default()
        };
        for (subscriber, result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        subscriber_id = %subscriber.id,
                        error = %e,
                        kind = e.error_kind(),
                        "send failed, dropping subscriber"
                    );
                    report.removed.push(subscriber.id.clone());
                }
            }
        }
        for id in &report.removed {
            self.disconnect(id);
        }

        debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            removed = report.removed.len(),
            "broadcast complete"
        );
        report
    }
}

#[async_trait]
impl ChangeHandler for Broadcaster {
    fn name(&self) -> &str {
        "broadcaster"
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), BridgeError> {
        self.broadcast(event).await;
        Ok(())
    }
}
