//! Remote document-store bridge.
//!
//! A pure transport with exactly three primitives: push one document, fetch
//! one document, subscribe to a logical collection. No business logic lives
//! here; the sync layer decides what to do with what arrives.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A document payload as stored remotely
pub type RemoteDoc = Value;

/// Transport-layer failures.
///
/// None of these are surfaced to the UI as hard failures: pushes are retried
/// with backoff and dropped subscription streams are re-established.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote is unreachable
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// HTTP transport error
    #[error("remote HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The remote refused the document
    #[error("remote rejected document at {path}: {message}")]
    Rejected {
        /// Target document path
        path: String,
        /// Remote-supplied reason
        message: String,
    },
    /// The remote returned a payload we cannot interpret
    #[error("invalid remote payload: {0}")]
    InvalidPayload(String),
}

/// Result type alias for bridge operations
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Path addressing one remote document, e.g. `collections/k1/responses/r1`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// `collections/{id}`
    #[must_use]
    pub fn collection(id: impl Into<String>) -> Self {
        Self {
            segments: vec!["collections".to_string(), id.into()],
        }
    }

    /// `collections/{collection}/responses/{id}`
    #[must_use]
    pub fn collection_response(collection_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "collections".to_string(),
                collection_id.into(),
                "responses".to_string(),
                id.into(),
            ],
        }
    }

    /// `customers/{customer}/responses/{id}`
    #[must_use]
    pub fn customer_response(customer_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "customers".to_string(),
                customer_id.into(),
                "responses".to_string(),
                id.into(),
            ],
        }
    }

    /// `collections/{collection}/messages/{id}`
    #[must_use]
    pub fn collection_message(collection_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "collections".to_string(),
                collection_id.into(),
                "messages".to_string(),
                id.into(),
            ],
        }
    }

    /// `customers/{customer}/messages/{id}`
    #[must_use]
    pub fn customer_message(customer_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "customers".to_string(),
                customer_id.into(),
                "messages".to_string(),
                id.into(),
            ],
        }
    }

    /// `users/{id}` — carries the push-delivery token field
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            segments: vec!["users".to_string(), id.into()],
        }
    }

    /// Last path segment (the document id)
    #[must_use]
    pub fn leaf_id(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// Path segments, outermost first
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The logical collection this document belongs to
    #[must_use]
    pub fn parent_query(&self) -> QueryPath {
        QueryPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Path addressing a logical collection of documents (a query root)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPath {
    segments: Vec<String>,
}

impl QueryPath {
    /// All collections
    #[must_use]
    pub fn collections() -> Self {
        Self {
            segments: vec!["collections".to_string()],
        }
    }

    /// Orders under one collection
    #[must_use]
    pub fn collection_responses(collection_id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "collections".to_string(),
                collection_id.into(),
                "responses".to_string(),
            ],
        }
    }

    /// Messages in a customer-centric thread
    #[must_use]
    pub fn customer_messages(customer_id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "customers".to_string(),
                customer_id.into(),
                "messages".to_string(),
            ],
        }
    }

    /// Messages in a collection-centric thread
    #[must_use]
    pub fn collection_messages(collection_id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "collections".to_string(),
                collection_id.into(),
                "messages".to_string(),
            ],
        }
    }

    /// Product stock documents
    #[must_use]
    pub fn products(owner_id: impl Into<String>) -> Self {
        Self {
            segments: vec![
                "users".to_string(),
                owner_id.into(),
                "products".to_string(),
            ],
        }
    }

    /// Document path for an id directly under this query root
    #[must_use]
    pub fn doc(&self, id: impl Into<String>) -> DocPath {
        let mut segments = self.segments.clone();
        segments.push(id.into());
        DocPath { segments }
    }

    /// Whether `path` addresses a direct child of this query root
    #[must_use]
    pub fn contains(&self, path: &DocPath) -> bool {
        path.segments.len() == self.segments.len() + 1
            && path.segments[..self.segments.len()] == self.segments[..]
    }
}

impl std::fmt::Display for QueryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// What happened to a document in a subscribed query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    /// New document (also used for the initial snapshot)
    Added,
    /// Existing document replaced
    Modified,
    /// Document deleted
    Removed,
}

/// One change delivered by a live subscription
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    /// Change kind
    pub kind: RemoteEventKind,
    /// Document path
    pub path: DocPath,
    /// Document payload; the last known payload for removals
    pub doc: RemoteDoc,
}

/// A live, cancellable subscription.
///
/// Delivers an initial full snapshot as `Added` events, then incremental
/// diffs. Dropping the subscription stops its producer.
pub struct RemoteSubscription {
    events: mpsc::UnboundedReceiver<RemoteEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl RemoteSubscription {
    /// Pair a receiver with the token its producer watches
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<RemoteEvent>, cancel: CancellationToken) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            events,
            cancel,
            _guard: guard,
        }
    }

    /// Wait for the next event; `None` after cancellation or producer exit
    pub async fn next_event(&mut self) -> Option<RemoteEvent> {
        tokio::select! {
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop the subscription
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled together with this subscription
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Pure transport to the remote document store.
///
/// The push/fetch futures carry a `Send` bound because callers run inside
/// spawned tasks on the multi-thread runtime.
pub trait RemoteBridge: Clone + Send + Sync + 'static {
    /// Write or replace one document. Idempotent under retry: pushing the
    /// same payload twice must be safe and produce no duplicate.
    fn push(
        &self,
        path: &DocPath,
        doc: RemoteDoc,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// One-shot read of one document
    fn fetch(&self, path: &DocPath) -> impl Future<Output = RemoteResult<Option<RemoteDoc>>> + Send;

    /// Open a live subscription on a logical collection
    fn subscribe(&self, query: &QueryPath) -> RemoteSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_path_display() {
        let path = DocPath::collection_response("k1", "r1");
        assert_eq!(path.to_string(), "collections/k1/responses/r1");
        assert_eq!(path.leaf_id(), "r1");
    }

    #[test]
    fn test_parent_query() {
        let path = DocPath::customer_message("c1", "m1");
        assert_eq!(path.parent_query(), QueryPath::customer_messages("c1"));
    }

    #[test]
    fn test_query_contains_direct_children_only() {
        let query = QueryPath::collection_responses("k1");
        assert!(query.contains(&DocPath::collection_response("k1", "r1")));
        assert!(!query.contains(&DocPath::collection_response("k2", "r1")));
        assert!(!query.contains(&DocPath::collection("k1")));
    }

    #[test]
    fn test_query_doc_roundtrip() {
        let query = QueryPath::customer_messages("c1");
        let path = query.doc("m9");
        assert_eq!(path.to_string(), "customers/c1/messages/m9");
        assert!(query.contains(&path));
    }
}
