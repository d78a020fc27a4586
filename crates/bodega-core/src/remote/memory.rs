//! In-memory remote used by tests and offline development.
//!
//! Behaves like the real document store from the engine's point of view:
//! documents live in a flat path-keyed map, subscriptions get an initial
//! snapshot and then incremental events, and the whole thing can be taken
//! offline with [`MemoryRemote::set_online`] to exercise retry paths.

use super::{
    DocPath, QueryPath, RemoteBridge, RemoteDoc, RemoteError, RemoteEvent, RemoteEventKind,
    RemoteResult, RemoteSubscription,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    query: QueryPath,
    tx: mpsc::UnboundedSender<RemoteEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    docs: Mutex<BTreeMap<String, RemoteDoc>>,
    subscribers: Mutex<Vec<Subscriber>>,
    offline: AtomicBool,
}

/// In-memory `RemoteBridge` implementation
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryRemote {
    /// Create an empty, online remote
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle reachability; while offline every push and fetch fails
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    /// Delete a document, notifying subscribers with a `Removed` event
    pub fn remove(&self, path: &DocPath) {
        let previous = {
            let mut docs = self
                .inner
                .docs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            docs.remove(&path.to_string())
        };
        if let Some(doc) = previous {
            self.notify(RemoteEvent {
                kind: RemoteEventKind::Removed,
                path: path.clone(),
                doc,
            });
        }
    }

    /// Number of stored documents
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.inner
            .docs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote is offline".to_string()));
        }
        Ok(())
    }

    fn notify(&self, event: RemoteEvent) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.retain(|sub| {
            if sub.cancel.is_cancelled() {
                return false;
            }
            if !sub.query.contains(&event.path) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

impl RemoteBridge for MemoryRemote {
    async fn push(&self, path: &DocPath, doc: RemoteDoc) -> RemoteResult<()> {
        self.check_online()?;
        let kind = {
            let mut docs = self
                .inner
                .docs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match docs.insert(path.to_string(), doc.clone()) {
                Some(_) => RemoteEventKind::Modified,
                None => RemoteEventKind::Added,
            }
        };
        self.notify(RemoteEvent {
            kind,
            path: path.clone(),
            doc,
        });
        Ok(())
    }

    async fn fetch(&self, path: &DocPath) -> RemoteResult<Option<RemoteDoc>> {
        self.check_online()?;
        let docs = self
            .inner
            .docs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(docs.get(&path.to_string()).cloned())
    }

    fn subscribe(&self, query: &QueryPath) -> RemoteSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Initial snapshot before any live event
        {
            let docs = self
                .inner
                .docs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (key, doc) in docs.iter() {
                let path = DocPath {
                    segments: key.split('/').map(ToString::to_string).collect(),
                };
                if query.contains(&path) {
                    let _ = tx.send(RemoteEvent {
                        kind: RemoteEventKind::Added,
                        path,
                        doc: doc.clone(),
                    });
                }
            }
        }

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Subscriber {
                query: query.clone(),
                tx,
                cancel: cancel.clone(),
            });

        RemoteSubscription::new(rx, cancel)
    }
}
