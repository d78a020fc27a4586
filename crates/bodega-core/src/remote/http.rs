//! HTTP adapter for the remote document store.
//!
//! Documents are addressed as `{endpoint}/{path}` and exchanged as JSON.
//! The backing service has no streaming API, so subscriptions poll the
//! query root and diff consecutive snapshots into change events.

use super::{
    DocPath, QueryPath, RemoteBridge, RemoteDoc, RemoteError, RemoteEvent, RemoteEventKind,
    RemoteResult, RemoteSubscription,
};
use crate::util::{compact_text, normalize_text_option};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP implementation of `RemoteBridge`
#[derive(Clone)]
pub struct HttpRemote {
    endpoint: String,
    client: reqwest::Client,
    poll_interval: Duration,
}

impl HttpRemote {
    /// Create a client against `endpoint`, which must include the scheme
    pub fn new(endpoint: impl Into<String>) -> RemoteResult<Self> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint.into())?,
            client: reqwest::Client::builder().build()?,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the subscription poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    /// Fetch every document under a query root as an id-to-document map
    async fn snapshot(&self, query: &QueryPath) -> RemoteResult<BTreeMap<String, RemoteDoc>> {
        let response = self
            .client
            .get(self.url_for(&query.to_string()))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected {
                path: query.to_string(),
                message: parse_api_error(status, &body),
            });
        }

        response
            .json::<BTreeMap<String, RemoteDoc>>()
            .await
            .map_err(|err| RemoteError::InvalidPayload(err.to_string()))
    }
}

impl RemoteBridge for HttpRemote {
    async fn push(&self, path: &DocPath, doc: RemoteDoc) -> RemoteResult<()> {
        let response = self
            .client
            .put(self.url_for(&path.to_string()))
            .json(&doc)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected {
                path: path.to_string(),
                message: parse_api_error(status, &body),
            });
        }
        Ok(())
    }

    async fn fetch(&self, path: &DocPath) -> RemoteResult<Option<RemoteDoc>> {
        let response = self
            .client
            .get(self.url_for(&path.to_string()))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected {
                path: path.to_string(),
                message: parse_api_error(status, &body),
            });
        }

        let doc = response
            .json::<RemoteDoc>()
            .await
            .map_err(|err| RemoteError::InvalidPayload(err.to_string()))?;
        Ok(Some(doc))
    }

    fn subscribe(&self, query: &QueryPath) -> RemoteSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let remote = self.clone();
        let query = query.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut known: BTreeMap<String, RemoteDoc> = BTreeMap::new();
            let mut primed = false;
            loop {
                match remote.snapshot(&query).await {
                    Ok(current) => {
                        for event in diff_snapshots(&query, &known, &current, primed) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        known = current;
                        primed = true;
                    }
                    Err(err) => {
                        // Transient transport failures keep the poll loop alive
                        tracing::debug!(query = %query, error = %err, "poll failed, will retry");
                    }
                }

                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    () = tokio::time::sleep(remote.poll_interval) => {}
                }
            }
        });

        RemoteSubscription::new(rx, cancel)
    }
}

/// Turn two consecutive snapshots into change events. Before the first
/// successful poll everything is `Added`.
fn diff_snapshots(
    query: &QueryPath,
    known: &BTreeMap<String, RemoteDoc>,
    current: &BTreeMap<String, RemoteDoc>,
    primed: bool,
) -> Vec<RemoteEvent> {
    let mut events = Vec::new();
    for (id, doc) in current {
        let kind = match known.get(id) {
            None => RemoteEventKind::Added,
            Some(previous) if previous != doc => RemoteEventKind::Modified,
            Some(_) => continue,
        };
        events.push(RemoteEvent {
            kind,
            path: query.doc(id),
            doc: doc.clone(),
        });
    }
    if primed {
        for (id, doc) in known {
            if !current.contains_key(id) {
                events.push(RemoteEvent {
                    kind: RemoteEventKind::Removed,
                    path: query.doc(id),
                    doc: doc.clone(),
                });
            }
        }
    }
    events
}

fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() {
        RemoteError::Unavailable(err.to_string())
    } else {
        RemoteError::Http(err)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> RemoteResult<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| RemoteError::InvalidPayload("endpoint must not be empty".to_string()))?;
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidPayload(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}
