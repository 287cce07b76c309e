use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use stockpulse_core::{BridgeError, ChangeNotifier, ConnectionId, Notification};

use crate::source::{NotificationConnection, NotificationSource};

/// In-process change-event source with LISTEN/NOTIFY semantics: a message
/// published on a channel reaches every connection currently listening on it,
/// in publish order, and is lost for everyone else.
#[derive(Clone, Default)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// Open connections and the sender feeding each one.
    open: DashMap<ConnectionId, mpsc::UnboundedSender<Notification>>,
    /// Channel name to the connections listening on it.
    channels: DashMap<String, Vec<ConnectionId>>,
    unreachable: AtomicBool,
    connect_attempts: AtomicU64,
}

impl HubInner {
    fn forget(&self, id: &ConnectionId) -> bool {
        let removed = self.open.remove(id).is_some();
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().retain(|c| c != id);
        }
        removed
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` on `channel`. Returns how many connections got it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let Some(listeners) = self.inner.channels.get(channel).map(|l| l.clone()) else {
            return 0;
        };
        let mut delivered = 0;
        for id in &listeners {
            if let Some(tx) = self.inner.open.get(id) {
                if tx.send(Notification::new(channel, payload)).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(channel, delivered, "published notification");
        delivered
    }

    /// Sever every open connection, as if the server restarted. Messages
    /// already queued on a connection are still delivered before it reports
    /// the close.
    pub fn drop_connections(&self) -> usize {
        let ids: Vec<ConnectionId> = self.inner.open.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.inner.forget(id);
        }
        info!(dropped = ids.len(), "dropped all hub connections");
        ids.len()
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.open.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of open connections listening on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner.channels.get(channel).map(|l| l.len()).unwrap_or(0)
    }
}

impl ChangeNotifier for ChannelHub {
    fn notify(&self, channel: &str, payload: &str) {
        self.publish(channel, payload);
    }
}

#[async_trait]
impl NotificationSource for ChannelHub {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>, BridgeError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("channel hub is unreachable".into()));
        }
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.open.insert(id.clone(), tx);
        debug!(connection_id = %id, "hub connection opened");
        Ok(Box::new(HubConnection {
            id,
            hub: Arc::clone(&self.inner),
            rx,
        }))
    }

    fn describe(&self) -> String {
        "in-process channel hub".into()
    }
}

struct HubConnection {
    id: ConnectionId,
    hub: Arc<HubInner>,
    rx: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl NotificationConnection for HubConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn listen(&mut self, channel: &str) -> Result<(), BridgeError> {
        if !self.hub.open.contains_key(&self.id) {
            return Err(BridgeError::Connection(format!("connection {} is closed", self.id)));
        }
        let mut listeners = self.hub.channels.entry(channel.to_string()).or_default();
        if !listeners.contains(&self.id) {
            listeners.push(self.id.clone());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if self.hub.forget(&self.id) {
            debug!(connection_id = %self.id, "hub connection closed");
        }
        self.rx.close();
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.hub.forget(&self.id);
    }
}
