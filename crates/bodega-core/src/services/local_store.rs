//! Thread-safe local store service.
//!
//! The local database is the source of truth for every read. All writes,
//! local-origin and remote-origin alike, go through this service so a single
//! writer owns record state transitions. Local writes stamp records dirty;
//! remote-origin writes arrive pre-acknowledged and are stored clean.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::db::{
    CollectionRecord, CollectionRepository, Database, LibSqlCollectionRepository,
    LibSqlMessageRepository, LibSqlResponseRepository, MessageRepository, ResponseRecord,
    ResponseRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ChatMessage, Collection, CollectionId, CollectionItem, CollectionResponse, MessageId,
    ResponseId, ResponseStatus, SyncMeta,
};
use crate::util::unix_timestamp_ms;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Which logical table a change event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    /// Collections and their items
    Collections,
    /// Orders
    Responses,
    /// Chat messages
    Messages,
}

/// A row-change notification published after every committed write
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Logical table that changed
    pub table: StoreTable,
    /// Collection involved, when known
    pub collection_id: Option<CollectionId>,
    /// Customer thread involved, for message changes
    pub customer_id: Option<String>,
}

/// A live list subscription delivering a fresh snapshot after every
/// relevant change. Push-based; the feed never polls.
pub struct WatchFeed<T> {
    rx: mpsc::UnboundedReceiver<Vec<T>>,
}

impl<T> WatchFeed<T> {
    /// Wait for the next snapshot; `None` once the store shuts down
    pub async fn next_snapshot(&mut self) -> Option<Vec<T>> {
        self.rx.recv().await
    }
}

/// Thread-safe service owning the local database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl LocalStore {
    /// Open a store backed by a database file, creating parents as needed
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        Ok(Self::wrap(db))
    }

    /// Open an in-memory store (primarily for tests)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::wrap(db))
    }

    fn wrap(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            changes,
        }
    }

    /// Subscribe to raw change events
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine; nobody is watching yet
        let _ = self.changes.send(event);
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Commit a local collection write; the record comes out dirty
    pub async fn upsert_collection(
        &self,
        collection: &Collection,
        items: &[CollectionItem],
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlCollectionRepository::new(db.connection());
            repo.upsert(collection, items, &SyncMeta::dirty()).await?;
        }
        tracing::debug!(id = %collection.id, "local collection write committed");
        self.publish(ChangeEvent {
            table: StoreTable::Collections,
            collection_id: Some(collection.id),
            customer_id: None,
        });
        Ok(())
    }

    /// Apply a remote-origin collection; stored clean, never marked dirty
    pub async fn apply_remote_collection(
        &self,
        collection: &Collection,
        items: &[CollectionItem],
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlCollectionRepository::new(db.connection());
            repo.upsert(collection, items, &SyncMeta::clean(unix_timestamp_ms()))
                .await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Collections,
            collection_id: Some(collection.id),
            customer_id: None,
        });
        Ok(())
    }

    /// Fetch a collection snapshot by id
    pub async fn get_collection(&self, id: &CollectionId) -> Result<Option<CollectionRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlCollectionRepository::new(db.connection());
        repo.get(id).await
    }

    /// List collections, most recently updated first
    pub async fn list_collections(&self, owner_id: Option<&str>) -> Result<Vec<CollectionRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlCollectionRepository::new(db.connection());
        repo.list(owner_id).await
    }

    /// Delete a collection (remote-origin removal)
    pub async fn delete_collection(&self, id: &CollectionId) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlCollectionRepository::new(db.connection());
            repo.delete(id).await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Collections,
            collection_id: Some(*id),
            customer_id: None,
        });
        Ok(())
    }

    /// Record a confirmed push for a collection
    pub async fn mark_collection_clean(&self, id: &CollectionId, at: i64) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlCollectionRepository::new(db.connection());
            repo.mark_clean(id, at).await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Collections,
            collection_id: Some(*id),
            customer_id: None,
        });
        Ok(())
    }

    /// Record a failed push for a collection; the record stays dirty
    pub async fn mark_collection_error(&self, id: &CollectionId, message: &str) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlCollectionRepository::new(db.connection());
            repo.mark_error(id, message).await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Collections,
            collection_id: Some(*id),
            customer_id: None,
        });
        Ok(())
    }

    /// Dirty collections, oldest update first
    pub async fn dirty_collections(&self) -> Result<Vec<CollectionRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlCollectionRepository::new(db.connection());
        repo.list_dirty().await
    }

    /// Live collection-list subscription for one owner
    pub fn watch_collections(&self, owner_id: Option<String>) -> WatchFeed<CollectionRecord> {
        let store = self.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe_changes();

        tokio::spawn(async move {
            if !Self::send_collection_snapshot(&store, owner_id.as_deref(), &tx).await {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == StoreTable::Collections => {
                        if !Self::send_collection_snapshot(&store, owner_id.as_deref(), &tx).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    // Missed events are fine; the next snapshot is total anyway
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !Self::send_collection_snapshot(&store, owner_id.as_deref(), &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        WatchFeed { rx }
    }

    async fn send_collection_snapshot(
        store: &Self,
        owner_id: Option<&str>,
        tx: &mpsc::UnboundedSender<Vec<CollectionRecord>>,
    ) -> bool {
        match store.list_collections(owner_id).await {
            Ok(snapshot) => tx.send(snapshot).is_ok(),
            Err(error) => {
                tracing::warn!(%error, "collection watch query failed");
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Responses
    // -----------------------------------------------------------------------

    /// Commit a local order write; derived fields are refreshed first
    pub async fn upsert_response(&self, response: &CollectionResponse) -> Result<()> {
        let mut response = response.clone();
        response.recompute();
        {
            let db = self.db.lock().await;
            let repo = LibSqlResponseRepository::new(db.connection());
            repo.upsert(&response, &SyncMeta::dirty()).await?;
        }
        tracing::debug!(id = %response.id, "local response write committed");
        self.publish(ChangeEvent {
            table: StoreTable::Responses,
            collection_id: Some(response.collection_id),
            customer_id: response.customer_id.clone(),
        });
        Ok(())
    }

    /// Apply a remote-origin order; stored clean
    pub async fn apply_remote_response(&self, response: &CollectionResponse) -> Result<()> {
        let mut response = response.clone();
        response.recompute();
        {
            let db = self.db.lock().await;
            let repo = LibSqlResponseRepository::new(db.connection());
            repo.upsert(&response, &SyncMeta::clean(unix_timestamp_ms()))
                .await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Responses,
            collection_id: Some(response.collection_id),
            customer_id: response.customer_id.clone(),
        });
        Ok(())
    }

    /// Fetch an order snapshot by id
    pub async fn get_response(&self, id: &ResponseId) -> Result<Option<ResponseRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlResponseRepository::new(db.connection());
        repo.get(id).await
    }

    /// List orders for a collection, newest first
    pub async fn list_responses(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<ResponseRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlResponseRepository::new(db.connection());
        repo.list_for_collection(collection_id).await
    }

    /// Validate and commit a status change as a local write
    pub async fn update_response_status(
        &self,
        id: &ResponseId,
        next: ResponseStatus,
    ) -> Result<CollectionResponse> {
        let record = self
            .get_response(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let mut response = record.response;
        response.transition(next)?;
        self.upsert_response(&response).await?;
        Ok(response)
    }

    /// Delete an order (remote-origin removal)
    pub async fn delete_response(&self, id: &ResponseId) -> Result<()> {
        let collection_id = self
            .get_response(id)
            .await?
            .map(|record| record.response.collection_id);
        {
            let db = self.db.lock().await;
            let repo = LibSqlResponseRepository::new(db.connection());
            repo.delete(id).await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Responses,
            collection_id,
            customer_id: None,
        });
        Ok(())
    }

    /// Record a confirmed push for an order
    pub async fn mark_response_clean(&self, id: &ResponseId, at: i64) -> Result<()> {
        let (collection_id, customer_id) = {
            let db = self.db.lock().await;
            let repo = LibSqlResponseRepository::new(db.connection());
            repo.mark_clean(id, at).await?;
            Self::response_event_scope(&repo, id).await?
        };
        self.publish(ChangeEvent {
            table: StoreTable::Responses,
            collection_id,
            customer_id,
        });
        Ok(())
    }

    /// Record a failed push for an order; the record stays dirty
    pub async fn mark_response_error(&self, id: &ResponseId, message: &str) -> Result<()> {
        let (collection_id, customer_id) = {
            let db = self.db.lock().await;
            let repo = LibSqlResponseRepository::new(db.connection());
            repo.mark_error(id, message).await?;
            Self::response_event_scope(&repo, id).await?
        };
        self.publish(ChangeEvent {
            table: StoreTable::Responses,
            collection_id,
            customer_id,
        });
        Ok(())
    }

    async fn response_event_scope(
        repo: &LibSqlResponseRepository<'_>,
        id: &ResponseId,
    ) -> Result<(Option<CollectionId>, Option<String>)> {
        Ok(repo.get(id).await?.map_or((None, None), |record| {
            (
                Some(record.response.collection_id),
                record.response.customer_id,
            )
        }))
    }

    /// Dirty orders, oldest update first
    pub async fn dirty_responses(&self) -> Result<Vec<ResponseRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlResponseRepository::new(db.connection());
        repo.list_dirty().await
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Insert a local-origin message; tracked until the remote push lands.
    /// Returns false when the id was already present.
    pub async fn insert_message(&self, message: &ChatMessage) -> Result<bool> {
        self.insert_message_inner(message, true).await
    }

    /// Apply a remote-origin message; arrives pre-acknowledged, never
    /// queued for push. Replaying the same id is a no-op.
    pub async fn apply_remote_message(&self, message: &ChatMessage) -> Result<bool> {
        self.insert_message_inner(message, false).await
    }

    async fn insert_message_inner(&self, message: &ChatMessage, needs_sync: bool) -> Result<bool> {
        let inserted = {
            let db = self.db.lock().await;
            let repo = LibSqlMessageRepository::new(db.connection());
            repo.insert(message, needs_sync).await?
        };
        if inserted {
            self.publish(ChangeEvent {
                table: StoreTable::Messages,
                collection_id: Some(message.collection_id),
                customer_id: message.customer_id.clone(),
            });
        }
        Ok(inserted)
    }

    /// Unpushed messages, oldest send first
    pub async fn dirty_messages(&self) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        repo.list_dirty().await
    }

    /// Record a confirmed push for a message.
    ///
    /// No change event: the push flag is not part of any message snapshot.
    pub async fn mark_message_clean(&self, id: &MessageId) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        repo.mark_clean(id).await
    }

    /// Messages in a customer-centric thread, ascending by timestamp
    pub async fn customer_thread(&self, customer_id: &str) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        repo.list_customer_thread(customer_id).await
    }

    /// Messages in a collection-centric thread, ascending by timestamp
    pub async fn collection_thread(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        repo.list_collection_thread(collection_id).await
    }

    /// Batch, idempotent read marking
    pub async fn mark_messages_read(&self, ids: &[MessageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        {
            let db = self.db.lock().await;
            let repo = LibSqlMessageRepository::new(db.connection());
            repo.mark_read(ids).await?;
        }
        self.publish(ChangeEvent {
            table: StoreTable::Messages,
            collection_id: None,
            customer_id: None,
        });
        Ok(())
    }

    /// Count unread customer messages for a collection
    pub async fn count_unread(&self, collection_id: &CollectionId) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlMessageRepository::new(db.connection());
        repo.count_unread(collection_id).await
    }

    /// Live customer-thread subscription; snapshots ascending by timestamp
    pub fn watch_customer_thread(&self, customer_id: impl Into<String>) -> WatchFeed<ChatMessage> {
        let customer_id = customer_id.into();
        let store = self.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe_changes();

        tokio::spawn(async move {
            if !Self::send_customer_thread_snapshot(&store, &customer_id, &tx).await {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == StoreTable::Messages => {
                        if !Self::send_customer_thread_snapshot(&store, &customer_id, &tx).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !Self::send_customer_thread_snapshot(&store, &customer_id, &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        WatchFeed { rx }
    }

    async fn send_customer_thread_snapshot(
        store: &Self,
        customer_id: &str,
        tx: &mpsc::UnboundedSender<Vec<ChatMessage>>,
    ) -> bool {
        match store.customer_thread(customer_id).await {
            Ok(snapshot) => tx.send(snapshot).is_ok(),
            Err(error) => {
                tracing::warn!(%error, "customer thread watch query failed");
                true
            }
        }
    }

    /// Live collection-thread subscription; snapshots ascending by timestamp
    pub fn watch_collection_thread(&self, collection_id: CollectionId) -> WatchFeed<ChatMessage> {
        let store = self.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe_changes();

        tokio::spawn(async move {
            if !Self::send_collection_thread_snapshot(&store, collection_id, &tx).await {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == StoreTable::Messages => {
                        if !Self::send_collection_thread_snapshot(&store, collection_id, &tx).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !Self::send_collection_thread_snapshot(&store, collection_id, &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        WatchFeed { rx }
    }

    async fn send_collection_thread_snapshot(
        store: &Self,
        collection_id: CollectionId,
        tx: &mpsc::UnboundedSender<Vec<ChatMessage>>,
    ) -> bool {
        match store.collection_thread(&collection_id).await {
            Ok(snapshot) => tx.send(snapshot).is_ok(),
            Err(error) => {
                tracing::warn!(%error, "collection thread watch query failed");
                true
            }
        }
    }

    /// Live order-list subscription for one collection
    pub fn watch_responses(&self, collection_id: CollectionId) -> WatchFeed<ResponseRecord> {
        let store = self.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe_changes();

        tokio::spawn(async move {
            if !Self::send_response_snapshot(&store, collection_id, &tx).await {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == StoreTable::Responses => {
                        if !Self::send_response_snapshot(&store, collection_id, &tx).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !Self::send_response_snapshot(&store, collection_id, &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        WatchFeed { rx }
    }

    async fn send_response_snapshot(
        store: &Self,
        collection_id: CollectionId,
        tx: &mpsc::UnboundedSender<Vec<ResponseRecord>>,
    ) -> bool {
        match store.list_responses(&collection_id).await {
            Ok(snapshot) => tx.send(snapshot).is_ok(),
            Err(error) => {
                tracing::warn!(%error, "response watch query failed");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, SenderRole};
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_after_write_consistency() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let collection = Collection::new("owner-1", "Catalog");
        let items = vec![CollectionItem::new("p1", 0)];
        store.upsert_collection(&collection, &items).await.unwrap();

        // Immediately visible regardless of any remote
        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert_eq!(record.collection.name, "Catalog");
        assert!(record.meta.needs_sync);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_apply_is_clean() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let collection = Collection::new("owner-1", "From remote");
        store
            .apply_remote_collection(&collection, &[])
            .await
            .unwrap();

        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert!(record.meta.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_collections_pushes_snapshots() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut feed = store.watch_collections(Some("owner-1".to_string()));

        // Initial snapshot is empty
        let snapshot = feed.next_snapshot().await.unwrap();
        assert!(snapshot.is_empty());

        let collection = Collection::new("owner-1", "Catalog");
        store.upsert_collection(&collection, &[]).await.unwrap();

        let snapshot = feed.next_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].collection.name, "Catalog");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_response_status_validates_transition() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let mut response = CollectionResponse::new(CollectionId::new(), "Maria");
        response.set_item("p1", OrderItem::new(1, 100));
        store.upsert_response(&response).await.unwrap();

        store
            .update_response_status(&response.id, ResponseStatus::InProduction)
            .await
            .unwrap();

        let err = store
            .update_response_status(&response.id, ResponseStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_message_publishes_once() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut changes = store.subscribe_changes();

        let message = ChatMessage::new(
            CollectionId::new(),
            SenderRole::Client,
            "c1",
            "Maria",
            "hola",
        );
        assert!(store.insert_message(&message).await.unwrap());
        assert!(!store.insert_message(&message).await.unwrap());

        let event = changes.recv().await.unwrap();
        assert_eq!(event.table, StoreTable::Messages);
        // Replay did not publish a second event
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_response_sync_marks_carry_event_scope() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let collection_id = CollectionId::new();
        let mut response = CollectionResponse::new(collection_id, "Maria");
        response.customer_id = Some("c1".to_string());
        response.set_item("p1", OrderItem::new(1, 100));
        store.upsert_response(&response).await.unwrap();

        let mut changes = store.subscribe_changes();
        store.mark_response_clean(&response.id, 1000).await.unwrap();

        let event = changes.recv().await.unwrap();
        assert_eq!(event.table, StoreTable::Responses);
        assert_eq!(event.collection_id, Some(collection_id));
        assert_eq!(event.customer_id.as_deref(), Some("c1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_messages_tracked_until_acknowledged() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let collection_id = CollectionId::new();
        let mut local = ChatMessage::new(collection_id, SenderRole::Business, "owner", "Me", "hola");
        local.customer_id = Some("c1".to_string());
        store.insert_message(&local).await.unwrap();

        let incoming = ChatMessage::new(collection_id, SenderRole::Client, "anon", "Guest", "hey");
        store.apply_remote_message(&incoming).await.unwrap();

        // Only the local send waits for a push acknowledgement
        let dirty = store.dirty_messages().await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].id, local.id);

        store.mark_message_clean(&local.id).await.unwrap();
        assert!(store.dirty_messages().await.unwrap().is_empty());
    }
}
