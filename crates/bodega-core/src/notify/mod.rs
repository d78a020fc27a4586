//! Event deduplication and local notification triggering.
//!
//! Remote streams replay history on every (re)subscribe and the same event
//! can arrive on more than one stream, so everything user-facing funnels
//! through [`EventDeduper::admit`]: an id is admitted exactly once within
//! the eviction window, no matter how many streams carry it or how many
//! tasks race on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{
    Alert, AlertKind, ChatMessage, CollectionResponse, NotificationPayload, PayloadKind,
    SenderRole, StockEvent, UsageKind, UsageLimits, UsageSnapshot, UsageStatus,
};
use crate::remote::{
    DocPath, QueryPath, RemoteBridge, RemoteEvent, RemoteEventKind, RemoteResult,
};
use crate::services::LocalStore;
use crate::util::unix_timestamp_ms;

/// Admits each event id exactly once within a sliding time window
pub struct EventDeduper {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl EventDeduper {
    /// Create a deduper with the given eviction window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true exactly once per id until the window evicts it.
    ///
    /// Eviction happens inline on every call, so the set never grows past
    /// the ids seen within one window.
    pub fn admit(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now);
        true
    }

    /// Ids currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is currently tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides when a usage reading deserves a (re-)alert.
///
/// Alerts fire only in the Warning/Critical bands, and a kind re-alerts
/// only after its percentage moved at least `delta` points since the last
/// alert for that kind. A reading of 82 then 84 then 90 with a delta of 5
/// alerts at 82 and 90 but stays quiet at 84.
pub struct UsageMonitor {
    delta: f64,
    last_alerted: Mutex<HashMap<UsageKind, f64>>,
}

impl UsageMonitor {
    /// Create a monitor with the given re-alert delta in percentage points
    #[must_use]
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            last_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one reading; `Some` means an alert should fire now
    pub fn observe(&self, snapshot: UsageSnapshot) -> Option<(UsageStatus, f64)> {
        let status = snapshot.status();
        let mut last_alerted = self
            .last_alerted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if status == UsageStatus::Ok {
            // Dropping back below the band re-arms the kind
            last_alerted.remove(&snapshot.kind);
            return None;
        }

        match last_alerted.get(&snapshot.kind) {
            Some(last) if (snapshot.percent - last).abs() < self.delta => None,
            _ => {
                last_alerted.insert(snapshot.kind, snapshot.percent);
                Some((status, snapshot.percent))
            }
        }
    }
}

/// Tuning knobs for the notification trigger
#[derive(Debug, Clone)]
pub struct TriggerOptions {
    /// Events older than this are treated as historical backfill
    pub admission_window: Duration,
    /// Interval between local usage polls
    pub usage_poll_interval: Duration,
    /// Percentage-point movement required for a usage re-alert
    pub usage_alert_delta: f64,
    /// Plan limits used to derive usage percentages
    pub limits: UsageLimits,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            admission_window: Duration::from_secs(60),
            usage_poll_interval: Duration::from_secs(300),
            usage_alert_delta: 5.0,
            limits: UsageLimits::default(),
        }
    }
}

/// Turns remote streams and local usage polls into exactly-once alerts
pub struct NotificationTrigger<B: RemoteBridge> {
    store: LocalStore,
    remote: B,
    owner_id: String,
    options: TriggerOptions,
    deduper: Arc<EventDeduper>,
    usage: Arc<UsageMonitor>,
    cancel: CancellationToken,
    alerts: mpsc::UnboundedSender<Alert>,
}

impl<B: RemoteBridge> NotificationTrigger<B> {
    /// Create a trigger and the receiver its alerts arrive on
    #[must_use]
    pub fn new(
        store: LocalStore,
        remote: B,
        owner_id: impl Into<String>,
        options: TriggerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (alerts, rx) = mpsc::unbounded_channel();
        let deduper = Arc::new(EventDeduper::new(options.admission_window));
        let usage = Arc::new(UsageMonitor::new(options.usage_alert_delta));
        (
            Self {
                store,
                remote,
                owner_id: owner_id.into(),
                options,
                deduper,
                usage,
                cancel: CancellationToken::new(),
                alerts,
            },
            rx,
        )
    }

    /// Stop every stream and the usage poll as a unit
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled by [`Self::stop`]
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start monitoring: order streams per collection, chat streams per
    /// customer, the low-stock stream, and the interval usage poll.
    pub fn start(&self, collection_ids: &[String], customer_ids: &[String]) {
        for collection_id in collection_ids {
            self.watch_query(
                QueryPath::collection_responses(collection_id.clone()),
                StreamKind::Orders,
            );
        }
        for customer_id in customer_ids {
            self.watch_query(
                QueryPath::customer_messages(customer_id.clone()),
                StreamKind::Chat,
            );
        }
        self.watch_query(
            QueryPath::products(self.owner_id.clone()),
            StreamKind::Stock,
        );
        self.spawn_usage_poll();
    }

    fn watch_query(&self, query: QueryPath, kind: StreamKind) {
        let mut subscription = self.remote.subscribe(&query);
        let trigger = self.clone_parts();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.next_event() => match event {
                        Some(event) => trigger.handle_stream_event(kind, &event),
                        None => break,
                    },
                }
            }
        });
    }

    fn clone_parts(&self) -> TriggerCore {
        TriggerCore {
            owner_id: self.owner_id.clone(),
            admission_window: self.options.admission_window,
            deduper: Arc::clone(&self.deduper),
            alerts: self.alerts.clone(),
        }
    }

    fn spawn_usage_poll(&self) {
        let store = self.store.clone();
        let usage = Arc::clone(&self.usage);
        let limits = self.options.limits;
        let interval = self.options.usage_poll_interval;
        let alerts = self.alerts.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match usage_snapshots(&store, limits).await {
                    Ok(snapshots) => {
                        for snapshot in snapshots {
                            if let Some((status, percent)) = usage.observe(snapshot) {
                                let mut alert = Alert::new(
                                    AlertKind::UsageLimit,
                                    "Plan limit".to_string(),
                                    format!(
                                        "{} usage at {percent:.0}%",
                                        snapshot.kind.as_str()
                                    ),
                                );
                                alert.usage = Some((snapshot.kind, status, percent));
                                tracing::info!(kind = snapshot.kind.as_str(), percent, "usage alert");
                                let _ = alerts.send(alert);
                            }
                        }
                    }
                    Err(error) => tracing::warn!(%error, "usage poll failed"),
                }
            }
        });
    }

    /// Publish the device push token to the owner's `users/{id}` document.
    ///
    /// Called on token rotation and after sign-in; the remote keeps only
    /// the latest value, so repeated registration is harmless.
    pub async fn register_push_token(&self, token: &str) -> RemoteResult<()> {
        let doc = serde_json::json!({ "fcm_token": token });
        self.remote
            .push(&DocPath::user(self.owner_id.clone()), doc)
            .await?;
        tracing::debug!("push token registered");
        Ok(())
    }

    /// Convert a transport push payload into a local alert.
    ///
    /// Payloads share the deduper with the live streams, so a push that
    /// duplicates a stream event still surfaces only once.
    pub fn handle_payload(&self, payload: &NotificationPayload) -> Option<Alert> {
        let key = format!(
            "payload:{:?}:{}:{}:{}",
            payload.kind,
            payload.collection_id.as_deref().unwrap_or(""),
            payload.response_id.as_deref().unwrap_or(""),
            payload.title,
        );
        if !self.deduper.admit(&key) {
            return None;
        }

        let kind = match payload.kind {
            PayloadKind::Chat => AlertKind::ChatMessage,
            PayloadKind::Order => AlertKind::NewOrder,
            PayloadKind::Approval | PayloadKind::General => AlertKind::General,
        };
        let mut alert = Alert::new(kind, payload.title.clone(), payload.body.clone());
        alert.collection_id = payload
            .collection_id
            .as_deref()
            .and_then(|id| id.parse().ok());
        alert.response_id = payload
            .response_id
            .as_deref()
            .and_then(|id| id.parse().ok());
        Some(alert)
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Orders,
    Chat,
    Stock,
}

/// The shareable part of the trigger used inside stream tasks
struct TriggerCore {
    owner_id: String,
    admission_window: Duration,
    deduper: Arc<EventDeduper>,
    alerts: mpsc::UnboundedSender<Alert>,
}

impl TriggerCore {
    fn is_recent(&self, timestamp_ms: i64) -> bool {
        let age_ms = unix_timestamp_ms().saturating_sub(timestamp_ms);
        // Slight clock skew can put a live event in the future; that still
        // counts as recent
        age_ms <= 0 || Duration::from_millis(age_ms.unsigned_abs()) <= self.admission_window
    }

    fn handle_stream_event(&self, kind: StreamKind, event: &RemoteEvent) {
        match kind {
            StreamKind::Orders => self.handle_order_event(event),
            StreamKind::Chat => self.handle_chat_event(event),
            StreamKind::Stock => self.handle_stock_event(event),
        }
    }

    fn handle_order_event(&self, event: &RemoteEvent) {
        if event.kind != RemoteEventKind::Added {
            return;
        }
        let Ok(response) = serde_json::from_value::<CollectionResponse>(event.doc.clone()) else {
            tracing::debug!(path = %event.path, "unparseable order event");
            return;
        };
        // Initial-snapshot backfill never alerts
        if !self.is_recent(response.created_at) {
            return;
        }
        if !self.deduper.admit(&format!("order:{}", response.id)) {
            return;
        }

        let mut alert = Alert::new(
            AlertKind::NewOrder,
            "New order".to_string(),
            format!(
                "{} ordered {} item(s)",
                response.contact_name, response.item_count
            ),
        );
        alert.collection_id = Some(response.collection_id);
        alert.response_id = Some(response.id);
        tracing::info!(id = %response.id, "new order alert");
        let _ = self.alerts.send(alert);
    }

    fn handle_chat_event(&self, event: &RemoteEvent) {
        if event.kind != RemoteEventKind::Added {
            return;
        }
        let Ok(message) = serde_json::from_value::<ChatMessage>(event.doc.clone()) else {
            tracing::debug!(path = %event.path, "unparseable chat event");
            return;
        };
        // Own echo: the business never gets alerted about its own sends
        if message.sender_role == SenderRole::Business || message.sender_id == self.owner_id {
            return;
        }
        if !self.is_recent(message.sent_at) {
            return;
        }
        if !self.deduper.admit(&format!("chat:{}", message.id)) {
            return;
        }

        let mut alert = Alert::new(
            AlertKind::ChatMessage,
            message.sender_name.clone(),
            message.body.clone(),
        );
        alert.collection_id = Some(message.collection_id);
        tracing::info!(id = %message.id, "chat alert");
        let _ = self.alerts.send(alert);
    }

    fn handle_stock_event(&self, event: &RemoteEvent) {
        if event.kind == RemoteEventKind::Removed {
            return;
        }
        let Ok(stock) = serde_json::from_value::<StockEvent>(event.doc.clone()) else {
            tracing::debug!(path = %event.path, "unparseable stock event");
            return;
        };
        if !stock.is_low() || !self.is_recent(stock.at) {
            return;
        }
        // One alert per product per window, not per reading
        if !self.deduper.admit(&format!("stock:{}", stock.product_id)) {
            return;
        }

        let alert = Alert::new(
            AlertKind::LowStock,
            "Low stock".to_string(),
            format!("{} has {} left", stock.name, stock.remaining),
        );
        tracing::info!(product = %stock.product_id, remaining = stock.remaining, "low stock alert");
        let _ = self.alerts.send(alert);
    }
}

/// Derive usage snapshots from local counts
async fn usage_snapshots(store: &LocalStore, limits: UsageLimits) -> Result<Vec<UsageSnapshot>> {
    let collections = store.list_collections(None).await?;
    let mut response_count: u64 = 0;
    for record in &collections {
        let responses = store.list_responses(&record.collection.id).await?;
        response_count += u64::try_from(responses.len()).unwrap_or(u64::MAX);
    }
    let collection_count = u64::try_from(collections.len()).unwrap_or(u64::MAX);

    Ok(vec![
        UsageSnapshot::new(
            UsageKind::Collections,
            UsageLimits::percent_of(limits.max_collections, collection_count),
        ),
        UsageSnapshot::new(
            UsageKind::Responses,
            UsageLimits::percent_of(limits.max_responses, response_count),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Collection, CollectionId, OrderItem};
    use crate::remote::MemoryRemote;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_admit_exactly_once() {
        let deduper = EventDeduper::new(Duration::from_secs(60));
        assert!(deduper.admit("e1"));
        assert!(!deduper.admit("e1"));
        assert!(deduper.admit("e2"));
    }

    #[test]
    fn test_admit_exactly_once_under_concurrency() {
        let deduper = Arc::new(EventDeduper::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let deduper = Arc::clone(&deduper);
            handles.push(std::thread::spawn(move || {
                u32::from(deduper.admit("contended"))
            }));
        }
        let admitted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_window_eviction_re_admits() {
        let deduper = EventDeduper::new(Duration::from_millis(10));
        assert!(deduper.admit("e1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(deduper.admit("e1"));
        assert_eq!(deduper.len(), 1);
    }

    #[test]
    fn test_usage_realert_delta_scenario() {
        let monitor = UsageMonitor::new(5.0);
        let read = |p| monitor.observe(UsageSnapshot::new(UsageKind::Collections, p));

        // 82 -> 84 -> 90: alerts at 82 and 90 only, and 90 crosses into
        // the critical band
        assert_eq!(read(82.0), Some((UsageStatus::Warning, 82.0)));
        assert_eq!(read(84.0), None);
        assert_eq!(read(90.0), Some((UsageStatus::Critical, 90.0)));
    }

    #[test]
    fn test_usage_ok_rearms_and_never_alerts() {
        let monitor = UsageMonitor::new(5.0);
        let read = |p| monitor.observe(UsageSnapshot::new(UsageKind::Responses, p));

        assert_eq!(read(50.0), None);
        assert!(read(85.0).is_some());
        assert_eq!(read(60.0), None); // back to Ok, re-armed
        assert!(read(85.0).is_some()); // small move but fresh band entry
    }

    fn order_doc(collection_id: CollectionId) -> (crate::models::ResponseId, serde_json::Value) {
        let mut response = crate::models::CollectionResponse::new(collection_id, "Maria");
        response.set_item("p1", OrderItem::new(3, 500));
        (response.id, serde_json::to_value(&response).unwrap())
    }

    async fn next_alert(rx: &mut mpsc::UnboundedReceiver<Alert>) -> Alert {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for alert")
            .expect("alert channel closed")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_order_alert() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let collection_id = CollectionId::new();
        let (trigger, mut rx) = NotificationTrigger::new(
            store,
            remote.clone(),
            "owner-1",
            TriggerOptions::default(),
        );
        trigger.start(&[collection_id.as_str()], &[]);

        let (response_id, doc) = order_doc(collection_id);
        remote
            .push(
                &DocPath::collection_response(collection_id.as_str(), response_id.as_str()),
                doc,
            )
            .await
            .unwrap();

        let alert = next_alert(&mut rx).await;
        assert_eq!(alert.kind, AlertKind::NewOrder);
        assert_eq!(alert.response_id, Some(response_id));
        trigger.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_own_chat_echo_is_suppressed() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let (trigger, mut rx) = NotificationTrigger::new(
            store,
            remote.clone(),
            "owner-1",
            TriggerOptions::default(),
        );
        trigger.start(&[], &["c1".to_string()]);

        let collection_id = CollectionId::new();
        let mut echo = ChatMessage::new(collection_id, SenderRole::Business, "owner-1", "Me", "reply");
        echo.customer_id = Some("c1".to_string());
        remote
            .push(
                &DocPath::customer_message("c1", echo.id.as_str()),
                serde_json::to_value(&echo).unwrap(),
            )
            .await
            .unwrap();

        let mut incoming = ChatMessage::new(collection_id, SenderRole::Client, "c1", "Maria", "hola");
        incoming.customer_id = Some("c1".to_string());
        remote
            .push(
                &DocPath::customer_message("c1", incoming.id.as_str()),
                serde_json::to_value(&incoming).unwrap(),
            )
            .await
            .unwrap();

        // The echo never surfaced; the first alert is the customer message
        let alert = next_alert(&mut rx).await;
        assert_eq!(alert.kind, AlertKind::ChatMessage);
        assert_eq!(alert.body, "hola");
        trigger.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_historical_backfill_is_suppressed() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let collection_id = CollectionId::new();

        // Seed the remote before subscribing with an order far outside the
        // admission window; the initial snapshot replays it as Added.
        let (_, mut doc) = order_doc(collection_id);
        doc["created_at"] = serde_json::json!(unix_timestamp_ms() - 3_600_000);
        let stale_id = doc["id"].as_str().unwrap().to_string();
        remote
            .push(
                &DocPath::collection_response(collection_id.as_str(), &stale_id),
                doc,
            )
            .await
            .unwrap();

        let (trigger, mut rx) = NotificationTrigger::new(
            store,
            remote.clone(),
            "owner-1",
            TriggerOptions::default(),
        );
        trigger.start(&[collection_id.as_str()], &[]);

        // A fresh order still alerts, proving the stream is live
        let (response_id, fresh) = order_doc(collection_id);
        remote
            .push(
                &DocPath::collection_response(collection_id.as_str(), response_id.as_str()),
                fresh,
            )
            .await
            .unwrap();

        let alert = next_alert(&mut rx).await;
        assert_eq!(alert.response_id, Some(response_id));
        trigger.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_low_stock_alert_once_per_window() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let (trigger, mut rx) = NotificationTrigger::new(
            store,
            remote.clone(),
            "owner-1",
            TriggerOptions::default(),
        );
        trigger.start(&[], &[]);

        let stock = StockEvent {
            product_id: "p1".to_string(),
            name: "Croissant".to_string(),
            remaining: 2,
            threshold: 5,
            at: unix_timestamp_ms(),
        };
        let path = QueryPath::products("owner-1").doc("p1");
        remote
            .push(&path, serde_json::to_value(&stock).unwrap())
            .await
            .unwrap();
        let mut again = stock.clone();
        again.remaining = 1;
        again.at = unix_timestamp_ms();
        remote
            .push(&path, serde_json::to_value(&again).unwrap())
            .await
            .unwrap();

        let alert = next_alert(&mut rx).await;
        assert_eq!(alert.kind, AlertKind::LowStock);
        // Second reading deduped on the product id
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        trigger.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_usage_poll_alerts_on_warning() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for i in 0..4 {
            let collection = Collection::new("owner-1", format!("c{i}"));
            store.upsert_collection(&collection, &[]).await.unwrap();
        }

        let remote = MemoryRemote::new();
        let options = TriggerOptions {
            usage_poll_interval: Duration::from_millis(10),
            limits: UsageLimits {
                max_collections: 5,
                max_responses: 500,
            },
            ..TriggerOptions::default()
        };
        let (trigger, mut rx) = NotificationTrigger::new(store, remote, "owner-1", options);
        trigger.start(&[], &[]);

        // 4 of 5 collections = 80% = Warning
        let alert = next_alert(&mut rx).await;
        assert_eq!(alert.kind, AlertKind::UsageLimit);
        let (kind, status, percent) = alert.usage.unwrap();
        assert_eq!(kind, UsageKind::Collections);
        assert_eq!(status, UsageStatus::Warning);
        assert!((percent - 80.0).abs() < f64::EPSILON);
        trigger.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_push_token_overwrites() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let (trigger, _rx) = NotificationTrigger::new(
            store,
            remote.clone(),
            "owner-1",
            TriggerOptions::default(),
        );

        trigger.register_push_token("tok-1").await.unwrap();
        trigger.register_push_token("tok-2").await.unwrap();

        let doc = remote
            .fetch(&DocPath::user("owner-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["fcm_token"], "tok-2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_payload_maps_and_dedupes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let (trigger, _rx) =
            NotificationTrigger::new(store, remote, "owner-1", TriggerOptions::default());

        let collection_id = CollectionId::new();
        let payload = NotificationPayload {
            title: "New message".to_string(),
            body: "hola".to_string(),
            kind: PayloadKind::Chat,
            collection_id: Some(collection_id.as_str()),
            response_id: None,
        };

        let alert = trigger.handle_payload(&payload).unwrap();
        assert_eq!(alert.kind, AlertKind::ChatMessage);
        assert_eq!(alert.collection_id, Some(collection_id));
        // Redelivery of the same payload is swallowed
        assert!(trigger.handle_payload(&payload).is_none());
    }
}
