//! Data models for Bodega

mod collection;
mod message;
mod notification;
mod response;
mod sync_meta;
mod usage;

pub use collection::{validate_items, Collection, CollectionId, CollectionItem, CollectionStatus};
pub use message::{ChatMessage, MessageId, SenderRole};
pub use notification::{Alert, AlertKind, NotificationPayload, PayloadKind, StockEvent};
pub use response::{CollectionResponse, OrderItem, ResponseId, ResponseStatus};
pub use sync_meta::{SyncMeta, SyncState};
pub use usage::{UsageKind, UsageLimits, UsageSnapshot, UsageStatus};
