//! Chat message model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::CollectionId;

/// A unique identifier for a chat message, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new unique message ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Which side of the conversation sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// The business operator
    Business,
    /// A portal customer
    Client,
}

impl SenderRole {
    /// Stable string form used in storage columns
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Client => "client",
        }
    }

    /// Parse from the storage column form
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "business" => Some(Self::Business),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// One message in a chat thread
///
/// The collection id is always present, even for messages stored on the
/// customer-centric path, so consumers can resolve the catalog a message
/// belongs to without an extra lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier
    pub id: MessageId,
    /// Catalog this conversation is about
    pub collection_id: CollectionId,
    /// Identified customer the thread belongs to, if known
    pub customer_id: Option<String>,
    /// Sending side
    pub sender_role: SenderRole,
    /// Sender account id
    pub sender_id: String,
    /// Sender display name
    pub sender_name: String,
    /// Message body
    pub body: String,
    /// Attachment URLs
    pub attachments: Vec<String>,
    /// Send timestamp (Unix ms); total order within a thread
    pub sent_at: i64,
    /// Read flag; transitions are monotonic (never unread once read)
    pub read: bool,
}

impl ChatMessage {
    /// Create a message from the given sender
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        sender_role: SenderRole,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            collection_id,
            customer_id: None,
            sender_role,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            body: body.into(),
            attachments: Vec::new(),
            sent_at: chrono::Utc::now().timestamp_millis(),
            read: false,
        }
    }
}
