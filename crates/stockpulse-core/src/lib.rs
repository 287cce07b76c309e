pub mod errors;
pub mod events;
pub mod ids;
pub mod notifier;

pub use errors::BridgeError;
pub use events::{ChangeEvent, Notification};
pub use ids::{ConnectionId, SubscriberId};
pub use notifier::ChangeNotifier;
