use std::sync::Arc;

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use stockpulse_core::ChangeNotifier;

use crate::database::Database;
use crate::error::StoreError;

const COLUMNS: &str = "id, name, quantity, updated_at";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: i64,
    pub name: String,
    pub quantity: i64,
    pub updated_at: String,
}

/// Body of a create request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub quantity: i64,
}

/// Body of an update request. Only the quantity is mutable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuantityUpdate {
    pub quantity: i64,
}

/// Kind of committed mutation announced on the change channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Payload emitted once per committed mutation: the op plus the affected row.
/// Deletes carry the row as it was before removal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub op: ChangeOp,
    #[serde(flatten)]
    pub item: InventoryItem,
}

/// Data access for the inventory table. Every successful write is followed by
/// exactly one message on `channel`, emitted while the connection lock is still
/// held so messages leave in commit order.
pub struct InventoryRepo {
    db: Database,
    notifier: Arc<dyn ChangeNotifier>,
    channel: String,
}

impl InventoryRepo {
    pub fn new(db: Database, notifier: Arc<dyn ChangeNotifier>, channel: impl Into<String>) -> Self {
        Self {
            db,
            notifier,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[instrument(skip(self, item), fields(name = %item.name, quantity = item.quantity))]
    pub fn create(&self, item: &NewItem) -> Result<InventoryItem, StoreError> {
        let name = validate_name(&item.name)?;
        validate_quantity(item.quantity)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO inventory (name, quantity, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, item.quantity, now],
            )?;
            let created = InventoryItem {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                quantity: item.quantity,
                updated_at: now.clone(),
            };
            self.emit(ChangeOp::Insert, &created);
            Ok(created)
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<InventoryItem, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM inventory WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_item(row),
                None => Err(StoreError::NotFound(format!("inventory item {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<InventoryItem>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM inventory ORDER BY id"))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_item(row)?);
            }
            Ok(items)
        })
    }

    #[instrument(skip(self))]
    pub fn update_quantity(&self, id: i64, quantity: i64) -> Result<InventoryItem, StoreError> {
        validate_quantity(quantity)?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let updated = conn
                .query_row(
                    &format!(
                        "UPDATE inventory SET quantity = ?1, updated_at = ?2 WHERE id = ?3 RETURNING {COLUMNS}"
                    ),
                    rusqlite::params![quantity, now, id],
                    |row| Ok(row_to_item(row)),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("inventory item {id}")))??;
            self.emit(ChangeOp::Update, &updated);
            Ok(updated)
        })
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<InventoryItem, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn
                .query_row(
                    &format!("DELETE FROM inventory WHERE id = ?1 RETURNING {COLUMNS}"),
                    [id],
                    |row| Ok(row_to_item(row)),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("inventory item {id}")))??;
            self.emit(ChangeOp::Delete, &deleted);
            Ok(deleted)
        })
    }

    fn emit(&self, op: ChangeOp, item: &InventoryItem) {
        let message = ChangeMessage {
            op,
            item: item.clone(),
        };
        match serde_json::to_string(&message) {
            Ok(payload) => {
                debug!(channel = %self.channel, op = %op, id = item.id, "emitting change");
                self.notifier.notify(&self.channel, &payload);
            }
            Err(e) => warn!(channel = %self.channel, op = %op, error = %e, "failed to encode change"),
        }
    }
}

fn validate_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Invalid("name must not be empty".into()));
    }
    Ok(trimmed)
}

fn validate_quantity(quantity: i64) -> Result<(), StoreError> {
    if quantity < 0 {
        return Err(StoreError::Invalid(format!("quantity must be >= 0, got {quantity}")));
    }
    Ok(())
}

/// Map a row selected with `COLUMNS`. A column of the wrong type is a
/// `CorruptRow`, not a plain database error.
fn row_to_item(row: &rusqlite::Row<'_>) -> Result<InventoryItem, StoreError> {
    fn column<T: rusqlite::types::FromSql>(
        row: &rusqlite::Row<'_>,
        idx: usize,
        name: &'static str,
    ) -> Result<T, StoreError> {
        row.get(idx).map_err(|e| StoreError::CorruptRow {
            table: "inventory",
            column: name,
            detail: e.to_string(),
        })
    }

    Ok(InventoryItem {
        id: column(row, 0, "id")?,
        name: column(row, 1, "name")?,
        quantity: column(row, 2, "quantity")?,
        updated_at: column(row, 3, "updated_at")?,
    })
}
