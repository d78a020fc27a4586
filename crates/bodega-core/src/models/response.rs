//! Collection response (order) model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::CollectionId;

/// A unique identifier for an order, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId(Uuid);

impl ResponseId {
    /// Create a new unique response ID using UUID v7
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

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResponseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Fulfilment status of an order
///
/// Moves forward only; `Cancelled` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Accepted by the business
    #[default]
    Approved,
    /// Being prepared
    InProduction,
    /// Ready for pickup or delivery
    ReadyForDelivery,
    /// Handed over to the customer
    Delivered,
    /// Cancelled by either side
    Cancelled,
}

impl ResponseStatus {
    /// Stable string form used in storage columns
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::InProduction => "in_production",
            Self::ReadyForDelivery => "ready_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the storage column form
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "in_production" => Some(Self::InProduction),
            "ready_for_delivery" => Some(Self::ReadyForDelivery),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Approved => 0,
            Self::InProduction => 1,
            Self::ReadyForDelivery => 2,
            Self::Delivered => 3,
            Self::Cancelled => 4,
        }
    }

    /// Whether an order may move from `self` to `next`
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        match (self, next) {
            // Terminal states never move again
            (Self::Delivered | Self::Cancelled, _) => false,
            (_, Self::Cancelled) => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// One ordered product inside a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Quantity ordered
    pub quantity: u32,
    /// Unit price in cents at order time
    pub unit_price_cents: i64,
    /// Optional 1-5 product rating left by the customer
    pub rating: Option<u8>,
    /// Free-form customer notes
    pub notes: Option<String>,
    /// Customization choices (size, color, ...)
    pub customization: Option<String>,
}

impl OrderItem {
    /// Create an item with the given quantity and unit price
    #[must_use]
    pub const fn new(quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            quantity,
            unit_price_cents,
            rating: None,
            notes: None,
            customization: None,
        }
    }
}

/// An order submitted against a collection
///
/// `item_count` and `subtotal_cents` are derived from `items` and are
/// recomputed after every mutation that goes through this type's methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResponse {
    /// Unique identifier
    pub id: ResponseId,
    /// Parent collection
    pub collection_id: CollectionId,
    /// Identified customer account, if any
    pub customer_id: Option<String>,
    /// Anonymous access token for customers without an account
    pub access_token: Option<String>,
    /// Contact name supplied in the portal
    pub contact_name: String,
    /// Contact phone supplied in the portal
    pub contact_phone: Option<String>,
    /// Delivery method chosen by the customer
    pub delivery_method: String,
    /// Payment method chosen by the customer
    pub payment_method: String,
    /// Desired delivery date (Unix ms)
    pub desired_date: Option<i64>,
    /// Product id -> ordered item
    pub items: BTreeMap<String, OrderItem>,
    /// Derived: sum of item quantities
    pub item_count: u32,
    /// Derived: sum of quantity * unit price
    pub subtotal_cents: i64,
    /// Fulfilment status
    pub status: ResponseStatus,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl CollectionResponse {
    /// Create an empty order against the given collection
    #[must_use]
    pub fn new(collection_id: CollectionId, contact_name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: ResponseId::new(),
            collection_id,
            customer_id: None,
            access_token: None,
            contact_name: contact_name.into(),
            contact_phone: None,
            delivery_method: "pickup".to_string(),
            payment_method: "cash".to_string(),
            desired_date: None,
            items: BTreeMap::new(),
            item_count: 0,
            subtotal_cents: 0,
            status: ResponseStatus::Approved,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute `item_count` and `subtotal_cents` from the item map
    pub fn recompute(&mut self) {
        self.item_count = self.items.values().map(|item| item.quantity).sum();
        self.subtotal_cents = self
            .items
            .values()
            .map(|item| i64::from(item.quantity) * item.unit_price_cents)
            .sum();
    }

    /// Insert or replace an ordered item and refresh derived fields
    pub fn set_item(&mut self, product_id: impl Into<String>, item: OrderItem) {
        self.items.insert(product_id.into(), item);
        self.recompute();
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Remove an ordered item and refresh derived fields
    pub fn remove_item(&mut self, product_id: &str) {
        self.items.remove(product_id);
        self.recompute();
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Move the order to `next`, rejecting backward or terminal transitions
    pub fn transition(&mut self, next: ResponseStatus) -> Result<()> {
        if !self.status.can_transition(next) {
            return Err(Error::Validation(format!(
                "invalid status transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> CollectionResponse {
        CollectionResponse::new(CollectionId::new(), "Maria")
    }

    #[test]
    fn test_derived_fields_follow_item_map() {
        let mut response = sample();
        response.set_item("p1", OrderItem::new(2, 500));
        response.set_item("p2", OrderItem::new(3, 250));

        assert_eq!(response.item_count, 5);
        assert_eq!(response.subtotal_cents, 2 * 500 + 3 * 250);

        response.set_item("p1", OrderItem::new(1, 500));
        assert_eq!(response.item_count, 4);
        assert_eq!(response.subtotal_cents, 500 + 750);

        response.remove_item("p2");
        assert_eq!(response.item_count, 1);
        assert_eq!(response.subtotal_cents, 500);
    }

    #[test]
    fn test_forward_transitions_allowed() {
        let mut response = sample();
        response.transition(ResponseStatus::InProduction).unwrap();
        response
            .transition(ResponseStatus::ReadyForDelivery)
            .unwrap();
        response.transition(ResponseStatus::Delivered).unwrap();
        assert_eq!(response.status, ResponseStatus::Delivered);
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut response = sample();
        response.transition(ResponseStatus::InProduction).unwrap();
        let err = response.transition(ResponseStatus::Approved).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_skipping_a_stage_rejected() {
        let mut response = sample();
        assert!(response.transition(ResponseStatus::Delivered).is_err());
    }

    #[test]
    fn test_cancel_from_any_nonterminal_state() {
        let mut response = sample();
        response.transition(ResponseStatus::InProduction).unwrap();
        response.transition(ResponseStatus::Cancelled).unwrap();
        assert_eq!(response.status, ResponseStatus::Cancelled);

        // Terminal: no further moves
        assert!(response.transition(ResponseStatus::Approved).is_err());
    }

    #[test]
    fn test_delivered_is_terminal() {
        let mut response = sample();
        response.transition(ResponseStatus::InProduction).unwrap();
        response
            .transition(ResponseStatus::ReadyForDelivery)
            .unwrap();
        response.transition(ResponseStatus::Delivered).unwrap();
        assert!(response.transition(ResponseStatus::Cancelled).is_err());
    }
}
