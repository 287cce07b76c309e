//! Upstream side of the change-notification bridge: a single subscription to
//! named change channels, decoded and handed to registered handlers in
//! arrival order.

pub mod handler;
pub mod hub;
pub mod listener;
pub mod reconnect;
pub mod service;
pub mod source;

pub use handler::{handler_fn, ChangeHandler, FnHandler};
pub use hub::ChannelHub;
pub use listener::{ListenOutcome, ListenerState, UpstreamListener};
pub use reconnect::ReconnectPolicy;
pub use service::{ListenerHandle, ListenerService};
pub use source::{NotificationConnection, NotificationSource};
