use std::time::Duration;

/// Error taxonomy for the change-notification bridge.
/// Only `Connection` is allowed to reach the caller of the setup sequence;
/// every other variant is contained where it happens and logged.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    // Upstream
    #[error("connection error: {0}")]
    Connection(String),

    // Per message
    #[error("decode error on channel {channel}: {detail}")]
    Decode { channel: String, detail: String },

    // Per handler invocation
    #[error("handler {handler} failed: {detail}")]
    Handler { handler: String, detail: String },

    // Per subscriber
    #[error("send to subscriber failed: {0}")]
    SubscriberSend(String),
    #[error("send to subscriber timed out after {0:?}")]
    SubscriberTimeout(Duration),
}

impl BridgeError {
    pub fn handler(handler: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Handler {
            handler: handler.into(),
            detail: detail.to_string(),
        }
    }

    /// Only upstream connection failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Decode { .. } => "decode",
            Self::Handler { .. } => "handler",
            Self::SubscriberSend(_) => "subscriber_send",
            Self::SubscriberTimeout(_) => "subscriber_timeout",
        }
    }
}
