use async_trait::async_trait;

use stockpulse_core::{BridgeError, ConnectionId, Notification};

/// Something that can open connections to a change-event source.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Open a fresh connection. Fails with `BridgeError::Connection` when the
    /// source is unreachable or refuses the connection.
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>, BridgeError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// One live connection to the event source.
#[async_trait]
pub trait NotificationConnection: Send {
    fn id(&self) -> &ConnectionId;

    /// Subscribe this connection to `channel`. Idempotent.
    async fn listen(&mut self, channel: &str) -> Result<(), BridgeError>;

    /// Next message in arrival order, or `None` once the peer has closed the
    /// connection. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Notification>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}
