//! Chat channel with dual-route threading.
//!
//! Conversations about a collection live on exactly one of two paths. When
//! the customer has an identified account the thread is customer-centric
//! and spans every collection they interacted with; otherwise it falls back
//! to a collection-centric thread shared by anonymous portal visitors. The
//! route is resolved once per call, so a message is never stored or
//! delivered on both paths.

use crate::error::Result;
use crate::models::{ChatMessage, CollectionId, MessageId};
use crate::remote::{DocPath, QueryPath, RemoteBridge};
use crate::services::{LocalStore, WatchFeed};

/// Where a thread lives remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRoute {
    /// Identified customer; spans collections
    Customer(String),
    /// Anonymous visitors of one collection
    Collection(CollectionId),
}

impl ThreadRoute {
    /// Resolve the route for one call. Customer identity wins whenever it
    /// is known.
    #[must_use]
    pub fn resolve(customer_id: Option<&str>, collection_id: CollectionId) -> Self {
        match customer_id {
            Some(id) if !id.trim().is_empty() => Self::Customer(id.trim().to_string()),
            _ => Self::Collection(collection_id),
        }
    }

    /// Remote document path for one message on this route
    #[must_use]
    pub fn doc_path(&self, message_id: &MessageId) -> DocPath {
        match self {
            Self::Customer(customer_id) => {
                DocPath::customer_message(customer_id.clone(), message_id.as_str())
            }
            Self::Collection(collection_id) => {
                DocPath::collection_message(collection_id.as_str(), message_id.as_str())
            }
        }
    }

    /// Remote query root for this route's live stream
    #[must_use]
    pub fn query_path(&self) -> QueryPath {
        match self {
            Self::Customer(customer_id) => QueryPath::customer_messages(customer_id.clone()),
            Self::Collection(collection_id) => {
                QueryPath::collection_messages(collection_id.as_str())
            }
        }
    }
}

/// Sends and streams chat messages over the resolved thread route
#[derive(Clone)]
pub struct ChatChannel<B: RemoteBridge> {
    store: LocalStore,
    remote: B,
}

impl<B: RemoteBridge> ChatChannel<B> {
    /// Create a channel over the given store and remote
    pub const fn new(store: LocalStore, remote: B) -> Self {
        Self { store, remote }
    }

    /// Send a message.
    ///
    /// The message lands locally first and is immediately visible to thread
    /// subscribers. On a failed remote push the message stays queued and
    /// the next sync resume pushes it again.
    pub async fn send(
        &self,
        mut message: ChatMessage,
        customer_id: Option<&str>,
    ) -> Result<ChatMessage> {
        let route = ThreadRoute::resolve(customer_id, message.collection_id);
        message.customer_id = match &route {
            ThreadRoute::Customer(id) => Some(id.clone()),
            ThreadRoute::Collection(_) => None,
        };

        self.store.insert_message(&message).await?;

        let path = route.doc_path(&message.id);
        let doc = serde_json::to_value(&message)?;
        match self.remote.push(&path, doc).await {
            Ok(()) => self.store.mark_message_clean(&message.id).await?,
            Err(error) => {
                tracing::warn!(%path, %error, "chat push failed; message queued for resume");
            }
        }
        Ok(message)
    }

    /// Live ascending-by-timestamp stream for the resolved thread
    #[must_use]
    pub fn messages(
        &self,
        customer_id: Option<&str>,
        collection_id: CollectionId,
    ) -> WatchFeed<ChatMessage> {
        match ThreadRoute::resolve(customer_id, collection_id) {
            ThreadRoute::Customer(id) => self.store.watch_customer_thread(id),
            ThreadRoute::Collection(id) => self.store.watch_collection_thread(id),
        }
    }

    /// One-shot snapshot of the resolved thread
    pub async fn thread(
        &self,
        customer_id: Option<&str>,
        collection_id: CollectionId,
    ) -> Result<Vec<ChatMessage>> {
        match ThreadRoute::resolve(customer_id, collection_id) {
            ThreadRoute::Customer(id) => self.store.customer_thread(&id).await,
            ThreadRoute::Collection(id) => self.store.collection_thread(&id).await,
        }
    }

    /// Batch, idempotent read marking
    pub async fn mark_read(&self, ids: &[MessageId]) -> Result<()> {
        self.store.mark_messages_read(ids).await
    }
}
