//! Notification and alert models

use serde::{Deserialize, Serialize};

use crate::models::{CollectionId, ResponseId, UsageKind, UsageStatus};

/// Category field of the transport push payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// New chat message
    Chat,
    /// An order was approved
    Approval,
    /// New order submitted
    Order,
    /// Anything else
    #[default]
    General,
}

/// Push payload delivered by the transport layer.
///
/// This is the only wire format with external compatibility requirements;
/// field names must stay as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Alert title
    pub title: String,
    /// Alert body
    pub body: String,
    /// Category selecting the local alert kind
    #[serde(rename = "type", default)]
    pub kind: PayloadKind,
    /// Catalog the event belongs to, when applicable
    #[serde(rename = "collectionId", default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Order the event belongs to, when applicable
    #[serde(rename = "responseId", default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

/// Local alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A customer submitted a new order
    NewOrder,
    /// A customer sent a chat message
    ChatMessage,
    /// A product crossed its low-stock threshold
    LowStock,
    /// A plan limit reached Warning or Critical
    UsageLimit,
    /// Untyped transport notification
    General,
}

/// A user-facing alert produced by the notification trigger
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    /// Category
    pub kind: AlertKind,
    /// Short title
    pub title: String,
    /// Body text
    pub body: String,
    /// Catalog involved, when known
    pub collection_id: Option<CollectionId>,
    /// Order involved, when known
    pub response_id: Option<ResponseId>,
    /// Usage details for `UsageLimit` alerts
    pub usage: Option<(UsageKind, UsageStatus, f64)>,
}

impl Alert {
    /// Build an alert with just a kind, title, and body
    #[must_use]
    pub const fn new(kind: AlertKind, title: String, body: String) -> Self {
        Self {
            kind,
            title,
            body,
            collection_id: None,
            response_id: None,
            usage: None,
        }
    }
}

/// A product stock reading from the low-stock stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEvent {
    /// Product identifier
    pub product_id: String,
    /// Product display name
    pub name: String,
    /// Units remaining
    pub remaining: i64,
    /// Threshold below which the product counts as low stock
    pub threshold: i64,
    /// Reading timestamp (Unix ms)
    pub at: i64,
}

impl StockEvent {
    /// Whether this reading is at or below the low-stock threshold
    #[must_use]
    pub const fn is_low(&self) -> bool {
        self.remaining <= self.threshold
    }
}
