pub mod broadcast;
pub mod client;
pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod server;

pub use broadcast::{BroadcastReport, Broadcaster, ChannelSink, EventSink, Subscriber};
pub use error::{ApiError, ServerError};
pub use event_bridge::EventBridge;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
