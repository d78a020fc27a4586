//! Collection (catalog) model

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a collection, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(Uuid);

impl CollectionId {
    /// Create a new unique collection ID using UUID v7
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

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    /// Not yet visible to customers
    #[default]
    Draft,
    /// Visible and accepting orders
    Active,
    /// Hidden, kept for records
    Archived,
    /// Shared via direct link only
    Shared,
}

impl CollectionStatus {
    /// Stable string form used in storage columns
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Shared => "shared",
        }
    }

    /// Parse from the storage column form
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// One product entry within a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionItem {
    /// Reference to a product in the business's product list
    pub product_id: String,
    /// Display order within the collection, ascending
    pub position: u32,
    /// Price override in cents; `None` keeps the product's base price
    pub override_price_cents: Option<i64>,
    /// Highlighted in the customer portal
    pub featured: bool,
}

impl CollectionItem {
    /// Create an item at the given display position
    #[must_use]
    pub fn new(product_id: impl Into<String>, position: u32) -> Self {
        Self {
            product_id: product_id.into(),
            position,
            override_price_cents: None,
            featured: false,
        }
    }
}

/// A catalog owned by the business and exposed to customers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Unique identifier
    pub id: CollectionId,
    /// Business account that owns this collection
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: CollectionStatus,
    /// Customers this collection was shared with
    pub customer_ids: Vec<String>,
    /// Visual template selector for the portal
    pub template: String,
    /// Whether the portal chat is enabled for this collection
    pub chat_enabled: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl Collection {
    /// Create a new draft collection
    #[must_use]
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: CollectionId::new(),
            owner_id: owner_id.into(),
            name: name.into(),
            status: CollectionStatus::Draft,
            customer_ids: Vec::new(),
            template: "classic".to_string(),
            chat_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Touch the update timestamp
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

/// Reject item lists carrying the same product more than once.
///
/// Runs before any write; a duplicate product reference within one
/// collection is a validation error, never a storage error.
pub fn validate_items(items: &[CollectionItem]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.product_id.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate product '{}' in collection items",
                item.product_id
            )));
        }
    }
    Ok(())
}
