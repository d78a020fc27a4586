//! Sync coordinator: pushes dirty local records to the remote and folds
//! remote change streams back into the local store.
//!
//! Every record moves through `Clean -> Dirty -> {Clean | Dirty+Error}`.
//! Local writes stamp rows dirty; only a confirmed remote acknowledgement
//! marks them clean again. While a row is dirty the local copy wins: remote
//! echoes of it are discarded until the pending push lands.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::chat::ThreadRoute;
use crate::db::{CollectionRecord, ResponseRecord};
use crate::error::Result;
use crate::models::{
    ChatMessage, Collection, CollectionItem, CollectionResponse, SyncState,
};
use crate::remote::{
    DocPath, QueryPath, RemoteBridge, RemoteDoc, RemoteError, RemoteEvent, RemoteEventKind,
};
use crate::services::LocalStore;
use crate::util::unix_timestamp_ms;

/// Bounded exponential backoff for push retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Multiplier applied per failed attempt
    pub factor: u32,
    /// Total attempts before giving up on a record
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            factor: 2,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given zero-based failed attempt
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.factor).saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Wire shape of a collection document: the parent row with its ordered
/// items embedded
#[derive(Serialize, Deserialize)]
struct CollectionDoc {
    #[serde(flatten)]
    collection: Collection,
    items: Vec<CollectionItem>,
}

enum PushOutcome {
    Acked,
    Failed(String),
    Cancelled,
}

/// Drives push and pull between the local store and a remote bridge
#[derive(Clone)]
pub struct SyncCoordinator<B: RemoteBridge> {
    store: LocalStore,
    remote: B,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    state: watch::Sender<SyncState>,
}

impl<B: RemoteBridge> SyncCoordinator<B> {
    /// Create a coordinator; nothing runs until [`Self::run`] is spawned
    #[must_use]
    pub fn new(store: LocalStore, remote: B, backoff: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(SyncState::Offline);
        Self {
            store,
            remote,
            backoff,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Observe coarse sync state transitions
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Token that stops the coordinator and abandons in-flight retries
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run loop and any retry sleeps
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, next: SyncState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::info!(state = ?next, "sync state changed");
                *current = next;
                true
            }
        });
    }

    /// Push every dirty record, oldest local update first.
    ///
    /// Run at startup and on manual refresh. Records whose retries exhaust
    /// stay dirty with the failure recorded; the next call picks them up
    /// again.
    pub async fn resume(&self) -> Result<()> {
        enum Pending {
            Collection(Box<CollectionRecord>),
            Response(Box<ResponseRecord>),
            Message(Box<ChatMessage>),
        }

        let mut pending: Vec<(i64, Pending)> = Vec::new();
        for record in self.store.dirty_collections().await? {
            pending.push((
                record.collection.updated_at,
                Pending::Collection(Box::new(record)),
            ));
        }
        for record in self.store.dirty_responses().await? {
            pending.push((
                record.response.updated_at,
                Pending::Response(Box::new(record)),
            ));
        }
        for message in self.store.dirty_messages().await? {
            pending.push((message.sent_at, Pending::Message(Box::new(message))));
        }
        pending.sort_by_key(|(updated_at, _)| *updated_at);

        tracing::debug!(count = pending.len(), "resuming dirty records");
        for (_, item) in pending {
            let done = match item {
                Pending::Collection(record) => self.push_collection(&record).await?,
                Pending::Response(record) => self.push_response(&record).await?,
                Pending::Message(message) => self.push_message(&message).await?,
            };
            if !done {
                // Cancelled mid-retry; leave the rest dirty for next time
                return Ok(());
            }
        }
        Ok(())
    }

    /// Push one collection; returns false when cancelled
    async fn push_collection(&self, record: &CollectionRecord) -> Result<bool> {
        let id = record.collection.id;
        let path = DocPath::collection(id.as_str());
        let doc = serde_json::to_value(CollectionDoc {
            collection: record.collection.clone(),
            items: record.items.clone(),
        })?;

        match self.push_with_backoff(&path, doc).await {
            PushOutcome::Acked => {
                self.store
                    .mark_collection_clean(&id, unix_timestamp_ms())
                    .await?;
                Ok(true)
            }
            PushOutcome::Failed(message) => {
                self.store.mark_collection_error(&id, &message).await?;
                Ok(true)
            }
            PushOutcome::Cancelled => Ok(false),
        }
    }

    /// Push one order; returns false when cancelled.
    ///
    /// Orders from identified customers also land under the customer's own
    /// tree so their portal sees the order without scanning collections.
    async fn push_response(&self, record: &ResponseRecord) -> Result<bool> {
        let id = record.response.id;
        let doc = serde_json::to_value(&record.response)?;

        let mut paths = vec![DocPath::collection_response(
            record.response.collection_id.as_str(),
            id.as_str(),
        )];
        if let Some(customer) = record.response.customer_id.as_deref() {
            paths.push(DocPath::customer_response(customer, id.as_str()));
        }

        for path in &paths {
            match self.push_with_backoff(path, doc.clone()).await {
                PushOutcome::Acked => {}
                PushOutcome::Failed(message) => {
                    // Next resume replays both paths; pushes are idempotent
                    self.store.mark_response_error(&id, &message).await?;
                    return Ok(true);
                }
                PushOutcome::Cancelled => return Ok(false),
            }
        }
        self.store
            .mark_response_clean(&id, unix_timestamp_ms())
            .await?;
        Ok(true)
    }

    /// Push one chat message; returns false when cancelled.
    ///
    /// Messages carry no error column; a failed push leaves the message
    /// queued and the next resume picks it up again.
    async fn push_message(&self, message: &ChatMessage) -> Result<bool> {
        let route = ThreadRoute::resolve(message.customer_id.as_deref(), message.collection_id);
        let path = route.doc_path(&message.id);
        let doc = serde_json::to_value(message)?;

        match self.push_with_backoff(&path, doc).await {
            PushOutcome::Acked => {
                self.store.mark_message_clean(&message.id).await?;
                Ok(true)
            }
            PushOutcome::Failed(error) => {
                tracing::warn!(id = %message.id, %error, "message push failed; still queued");
                Ok(true)
            }
            PushOutcome::Cancelled => Ok(false),
        }
    }

    async fn push_with_backoff(&self, path: &DocPath, doc: RemoteDoc) -> PushOutcome {
        for attempt in 0..self.backoff.max_attempts {
            match self.remote.push(path, doc.clone()).await {
                Ok(()) => return PushOutcome::Acked,
                // The remote refused the document; retrying cannot help
                Err(err @ RemoteError::Rejected { .. }) => {
                    tracing::warn!(%path, error = %err, "push rejected");
                    return PushOutcome::Failed(err.to_string());
                }
                Err(err) => {
                    tracing::debug!(%path, attempt, error = %err, "push attempt failed");
                    if attempt + 1 == self.backoff.max_attempts {
                        return PushOutcome::Failed(err.to_string());
                    }
                    tokio::select! {
                        () = self.cancel.cancelled() => return PushOutcome::Cancelled,
                        () = tokio::time::sleep(self.backoff.delay_for(attempt)) => {}
                    }
                }
            }
        }
        PushOutcome::Cancelled
    }

    /// Fold one remote change into the local store.
    ///
    /// Dirty rows are left untouched: the pending local version wins and
    /// the remote echo is discarded.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> Result<()> {
        let segments = event.path.segments();
        match segments {
            [_, _, kind, _] if kind == "responses" => self.apply_response_event(event).await,
            [_, _, kind, _] if kind == "messages" => self.apply_message_event(event).await,
            [root, _] if root == "collections" => self.apply_collection_event(event).await,
            _ => {
                tracing::debug!(path = %event.path, "ignoring unrecognized remote path");
                Ok(())
            }
        }
    }

    async fn apply_collection_event(&self, event: &RemoteEvent) -> Result<()> {
        let doc: CollectionDoc = serde_json::from_value(event.doc.clone())?;
        let id = doc.collection.id;

        if let Some(local) = self.store.get_collection(&id).await? {
            if local.meta.needs_sync {
                tracing::debug!(%id, "discarding remote collection echo; local row is dirty");
                return Ok(());
            }
        }

        match event.kind {
            RemoteEventKind::Added | RemoteEventKind::Modified => {
                self.store
                    .apply_remote_collection(&doc.collection, &doc.items)
                    .await
            }
            RemoteEventKind::Removed => match self.store.delete_collection(&id).await {
                Ok(()) | Err(crate::Error::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    async fn apply_response_event(&self, event: &RemoteEvent) -> Result<()> {
        let response: CollectionResponse = serde_json::from_value(event.doc.clone())?;
        let id = response.id;

        if let Some(local) = self.store.get_response(&id).await? {
            if local.meta.needs_sync {
                tracing::debug!(%id, "discarding remote response echo; local row is dirty");
                return Ok(());
            }
        }

        match event.kind {
            RemoteEventKind::Added | RemoteEventKind::Modified => {
                self.store.apply_remote_response(&response).await
            }
            RemoteEventKind::Removed => match self.store.delete_response(&id).await {
                Ok(()) | Err(crate::Error::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    async fn apply_message_event(&self, event: &RemoteEvent) -> Result<()> {
        // Messages are append-only; removals carry nothing to undo
        if event.kind == RemoteEventKind::Removed {
            return Ok(());
        }
        let message: ChatMessage = serde_json::from_value(event.doc.clone())?;
        self.store.apply_remote_message(&message).await?;
        Ok(())
    }

    /// Run until cancelled: resume dirty records, then merge the given
    /// remote subscriptions into one dispatch loop.
    pub async fn run(&self, queries: Vec<QueryPath>) {
        self.set_state(SyncState::Syncing);
        match self.resume().await {
            Ok(()) => self.set_state(SyncState::Synced),
            Err(error) => {
                tracing::warn!(%error, "resume failed");
                self.set_state(SyncState::Error);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for query in queries {
            let mut subscription = self.remote.subscribe(&query);
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        event = subscription.next_event() => match event {
                            Some(event) => {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        drop(tx);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(error) = self.apply_remote_event(&event).await {
                            tracing::warn!(path = %event.path, %error, "failed to apply remote event");
                        }
                    }
                    None => break,
                },
            }
        }
        self.set_state(SyncState::Offline);
    }

    /// Spawn [`Self::run`] on the runtime
    pub fn spawn(&self, queries: Vec<QueryPath>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run(queries).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderItem;
    use crate::remote::MemoryRemote;
    use pretty_assertions::assert_eq;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 1,
            factor: 2,
            max_attempts: 3,
        }
    }

    async fn seeded_store() -> (LocalStore, Collection, CollectionResponse) {
        let store = LocalStore::open_in_memory().await.unwrap();

        let collection = Collection::new("owner-1", "Catalog");
        let items = vec![CollectionItem::new("p1", 0)];
        store.upsert_collection(&collection, &items).await.unwrap();

        let mut response = CollectionResponse::new(collection.id, "Maria");
        response.set_item("p1", OrderItem::new(2, 500));
        store.upsert_response(&response).await.unwrap();

        (store, collection, response)
    }

    #[test]
    fn test_backoff_delays_grow_exponentially() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for(0), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_pushes_dirty_records_and_marks_clean() {
        let (store, collection, response) = seeded_store().await;
        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), fast_backoff());

        coordinator.resume().await.unwrap();

        assert_eq!(remote.doc_count(), 2);
        let collection_record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert!(collection_record.meta.is_clean());
        let response_record = store.get_response(&response.id).await.unwrap().unwrap();
        assert!(response_record.meta.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_is_idempotent() {
        let (store, _, _) = seeded_store().await;
        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store, remote.clone(), fast_backoff());

        coordinator.resume().await.unwrap();
        coordinator.resume().await.unwrap();

        // Replaying the same records produces no duplicates
        assert_eq!(remote.doc_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_exhausts_attempts_and_records_error() {
        let (store, collection, _) = seeded_store().await;
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), fast_backoff());

        coordinator.resume().await.unwrap();

        assert_eq!(remote.doc_count(), 0);
        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert!(record.meta.needs_sync);
        let error = record.meta.last_sync_error.unwrap();
        assert!(error.contains("unavailable"), "unexpected error: {error}");

        // Connectivity returns; the next resume drains the backlog
        remote.set_online(true);
        coordinator.resume().await.unwrap();
        assert_eq!(remote.doc_count(), 2);
        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert!(record.meta.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dirty_local_wins_over_remote_echo() {
        let (store, collection, _) = seeded_store().await;
        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote, fast_backoff());

        let mut remote_version = collection.clone();
        remote_version.name = "Renamed elsewhere".to_string();
        let event = RemoteEvent {
            kind: RemoteEventKind::Modified,
            path: DocPath::collection(collection.id.as_str()),
            doc: serde_json::to_value(CollectionDoc {
                collection: remote_version.clone(),
                items: vec![],
            })
            .unwrap(),
        };

        // Local row is dirty: the echo must be discarded
        coordinator.apply_remote_event(&event).await.unwrap();
        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert_eq!(record.collection.name, "Catalog");
        assert!(record.meta.needs_sync);

        // Once clean, the remote version applies
        store
            .mark_collection_clean(&collection.id, 1000)
            .await
            .unwrap();
        coordinator.apply_remote_event(&event).await.unwrap();
        let record = store.get_collection(&collection.id).await.unwrap().unwrap();
        assert_eq!(record.collection.name, "Renamed elsewhere");
        assert!(record.meta.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_removal_deletes_clean_row() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let collection = Collection::new("owner-1", "Catalog");
        store
            .apply_remote_collection(&collection, &[])
            .await
            .unwrap();

        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote, fast_backoff());
        let event = RemoteEvent {
            kind: RemoteEventKind::Removed,
            path: DocPath::collection(collection.id.as_str()),
            doc: serde_json::to_value(CollectionDoc {
                collection: collection.clone(),
                items: vec![],
            })
            .unwrap(),
        };

        coordinator.apply_remote_event(&event).await.unwrap();
        assert!(store.get_collection(&collection.id).await.unwrap().is_none());

        // Replaying the removal is harmless
        coordinator.apply_remote_event(&event).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_message_replay_inserts_once() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote, fast_backoff());

        let message = ChatMessage::new(
            crate::models::CollectionId::new(),
            crate::models::SenderRole::Client,
            "c1",
            "Maria",
            "hola",
        );
        let mut message = message;
        message.customer_id = Some("c1".to_string());
        let event = RemoteEvent {
            kind: RemoteEventKind::Added,
            path: DocPath::customer_message("c1", message.id.as_str()),
            doc: serde_json::to_value(&message).unwrap(),
        };

        coordinator.apply_remote_event(&event).await.unwrap();
        coordinator.apply_remote_event(&event).await.unwrap();

        let thread = store.customer_thread("c1").await.unwrap();
        assert_eq!(thread.len(), 1);
        // Remote-origin messages never queue for a push of their own
        assert!(store.dirty_messages().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_pushes_queued_messages() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut message = ChatMessage::new(
            crate::models::CollectionId::new(),
            crate::models::SenderRole::Business,
            "owner",
            "Me",
            "hola",
        );
        message.customer_id = Some("c1".to_string());
        store.insert_message(&message).await.unwrap();

        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), fast_backoff());
        coordinator.resume().await.unwrap();

        let path = DocPath::customer_message("c1", message.id.as_str());
        assert!(remote.fetch(&path).await.unwrap().is_some());
        assert!(store.dirty_messages().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_identified_order_lands_on_both_paths() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let collection = Collection::new("owner-1", "Catalog");
        store.upsert_collection(&collection, &[]).await.unwrap();

        let mut response = CollectionResponse::new(collection.id, "Maria");
        response.customer_id = Some("c1".to_string());
        response.set_item("p1", OrderItem::new(2, 500));
        store.upsert_response(&response).await.unwrap();

        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), fast_backoff());
        coordinator.resume().await.unwrap();

        let collection_path =
            DocPath::collection_response(collection.id.as_str(), response.id.as_str());
        let customer_path = DocPath::customer_response("c1", response.id.as_str());
        assert!(remote.fetch(&collection_path).await.unwrap().is_some());
        assert!(remote.fetch(&customer_path).await.unwrap().is_some());

        let record = store.get_response(&response.id).await.unwrap().unwrap();
        assert!(record.meta.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_applies_live_remote_events() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), fast_backoff());
        let handle = coordinator.spawn(vec![QueryPath::collections()]);

        let collection = Collection::new("owner-2", "Pushed remotely");
        let doc = serde_json::to_value(CollectionDoc {
            collection: collection.clone(),
            items: vec![],
        })
        .unwrap();
        remote
            .push(&DocPath::collection(collection.id.as_str()), doc)
            .await
            .unwrap();

        let mut applied = false;
        for _ in 0..100 {
            if store
                .get_collection(&collection.id)
                .await
                .unwrap()
                .is_some()
            {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied, "remote event never reached the local store");

        coordinator.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_collection_doc_roundtrip_preserves_sync_meta_exclusion() {
        // The wire document never carries sync metadata
        let collection = Collection::new("owner-1", "Catalog");
        let doc = serde_json::to_value(CollectionDoc {
            collection,
            items: vec![CollectionItem::new("p1", 0)],
        })
        .unwrap();
        assert!(doc.get("needs_sync").is_none());
        assert!(doc.get("last_sync_error").is_none());

        let parsed: CollectionDoc = serde_json::from_value(doc).unwrap();
        assert_eq!(parsed.items.len(), 1);
    }
}
