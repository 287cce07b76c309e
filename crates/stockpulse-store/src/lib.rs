pub mod database;
pub mod error;
pub mod inventory;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use inventory::{ChangeMessage, ChangeOp, InventoryItem, InventoryRepo, NewItem, QuantityUpdate};
