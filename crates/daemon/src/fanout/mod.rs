// Change fan-out: one store listener feeding a bounded queue, drained by a
// dispatcher task that delivers per-subscription payloads.
//
// The listener never blocks a store mutation. When the queue is full the
// newest event is dropped and counted; clients recover by re-listing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use workloop_common::event::ChangeEvent;
use workloop_common::protocol::notification::ChangeNotification;
use workloop_common::record::{new_id, Record};

use crate::store::DurableStore;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// The receiving end is gone; the subscription should be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("notification sink is closed")]
pub struct SinkClosed;

/// Delivery capability held by a subscription (e.g. a WebSocket writer).
///
/// Called from the dispatcher task; must not block.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: ChangeNotification) -> Result<(), SinkClosed>;
}

/// Sink backed by a bounded tokio channel. A full channel loses the
/// notification but keeps the subscription.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ChangeNotification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ChangeNotification>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChangeNotification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, notification: ChangeNotification) -> Result<(), SinkClosed> {
        match self.tx.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(notification)) => {
                warn!(subscription = %notification.id, "subscriber channel full, notification dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkClosed),
        }
    }
}

/// Sink that writes each notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: ChangeNotification) -> Result<(), SinkClosed> {
        info!(
            operation = notification.operation.as_str(),
            record_id = notification
                .record_id
                .as_deref()
                .or_else(|| notification.record.as_ref().and_then(|r| r.get("id")).and_then(|v| v.as_str())),
            "change"
        );
        Ok(())
    }
}

struct Subscription {
    sink: Arc<dyn NotificationSink>,
    /// Revision of the snapshot handed out on subscribe; older events are
    /// already reflected in it.
    since_revision: u64,
}

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<BTreeMap<String, Subscription>>,
    dropped: AtomicU64,
}

impl Shared {
    fn subscriptions(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ChangeNotifier<R: Record> {
    store: Arc<DurableStore<R>>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
    span: Span,
}

impl<R: Record> ChangeNotifier<R> {
    /// Register on `store` and spawn the dispatcher. Must be called within a
    /// tokio runtime.
    pub fn attach(store: Arc<DurableStore<R>>, capacity: usize) -> Self {
        Self::attach_with_span(store, capacity, info_span!("notifier", entity = R::ENTITY))
    }

    pub fn attach_with_span(store: Arc<DurableStore<R>>, capacity: usize, span: Span) -> Self {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel::<ChangeEvent<R>>(capacity.max(1));

        let listener_shared = shared.clone();
        let listener_span = span.clone();
        store.add_on_change_listener(Arc::new(move |event: &ChangeEvent<R>| {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    listener_shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        parent: &listener_span,
                        operation = dropped.operation.as_str(),
                        record_id = dropped.record_id(),
                        "notification queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }));

        let dispatcher = tokio::spawn(dispatch(rx, shared.clone()).instrument(span.clone()));
        Self { store, shared, dispatcher, span }
    }

    /// Register `sink` and return its subscription ID with the current
    /// records. Every change committed after the snapshot is delivered
    /// exactly once and in commit order; nothing before it is.
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) -> (String, Vec<R>) {
        let id = new_id();
        let records = self.store.snapshot_with(|snapshot| {
            self.shared.subscriptions().insert(
                id.clone(),
                Subscription { sink, since_revision: snapshot.revision },
            );
            snapshot.records
        });
        debug!(parent: &self.span, subscription = %id, "subscribed");
        (id, records)
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.shared.subscriptions().remove(id).is_some();
        if removed {
            debug!(parent: &self.span, subscription = %id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriptions().len()
    }

    /// Events lost to a full queue since attach.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<R: Record> Drop for ChangeNotifier<R> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch<R: Record>(mut rx: mpsc::Receiver<ChangeEvent<R>>, shared: Arc<Shared>) {
    while let Some(event) = rx.recv().await {
        let targets: Vec<(String, Arc<dyn NotificationSink>)> = shared
            .subscriptions()
            .iter()
            .filter(|(_, sub)| event.revision > sub.since_revision)
            .map(|(id, sub)| (id.clone(), sub.sink.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, sink) in targets {
            let notification = match ChangeNotification::for_subscription(&id, &event) {
                Ok(notification) => notification,
                Err(error) => {
                    warn!(%error, record_id = event.record_id(), "failed to encode notification");
                    continue;
                }
            };
            if sink.deliver(notification).is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut subscriptions = shared.subscriptions();
            for id in closed {
                subscriptions.remove(&id);
                debug!(subscription = %id, "sink closed, unsubscribed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::time::timeout;
    use workloop_common::event::ChangeOperation;
    use workloop_common::types::{AgentRole, AgentRoleDraft, AgentRolePatch};

    use super::*;

    fn draft(name: &str) -> AgentRoleDraft {
        AgentRoleDraft { name: name.into(), prompt: String::new() }
    }

    async fn next(rx: &mut mpsc::Receiver<ChangeNotification>) -> ChangeNotification {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification should arrive")
            .expect("channel should stay open")
    }

    #[tokio::test]
    async fn subscribe_returns_snapshot_and_then_live_changes() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let before = store.create(draft("before")).unwrap();
        let notifier = ChangeNotifier::attach(store.clone(), DEFAULT_QUEUE_CAPACITY);

        let (sink, mut rx) = ChannelSink::channel(16);
        let (sub_id, snapshot) = notifier.subscribe(Arc::new(sink));
        assert_eq!(snapshot, vec![before]);

        let after = store.create(draft("after")).unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.id, sub_id);
        assert_eq!(n.operation, ChangeOperation::Create);
        assert_eq!(n.record.as_ref().unwrap()["id"], after.id.as_str());

        store.delete(&after.id).unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.operation, ChangeOperation::Delete);
        assert_eq!(n.record_id.as_deref(), Some(after.id.as_str()));
        assert!(n.record.is_none());
    }

    #[tokio::test]
    async fn events_before_subscribe_are_not_redelivered() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let notifier = ChangeNotifier::attach(store.clone(), DEFAULT_QUEUE_CAPACITY);

        // Queued but not yet dispatched when the subscription is taken.
        store.create(draft("early")).unwrap();
        let (sink, mut rx) = ChannelSink::channel(16);
        let (_, snapshot) = notifier.subscribe(Arc::new(sink));
        assert_eq!(snapshot.len(), 1);

        let late = store.create(draft("late")).unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.record.as_ref().unwrap()["id"], late.id.as_str());
        assert!(rx.try_recv().is_err(), "the early create must not be delivered");
    }

    #[tokio::test]
    async fn closed_sink_is_unsubscribed() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let notifier = ChangeNotifier::attach(store.clone(), DEFAULT_QUEUE_CAPACITY);

        let (sink, rx) = ChannelSink::channel(4);
        notifier.subscribe(Arc::new(sink));
        drop(rx);
        assert_eq!(notifier.subscriber_count(), 1);

        store.create(draft("x")).unwrap();
        for _ in 0..50 {
            if notifier.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let notifier = ChangeNotifier::attach(store.clone(), DEFAULT_QUEUE_CAPACITY);

        let (sink, mut rx) = ChannelSink::channel(4);
        let (id, _) = notifier.subscribe(Arc::new(sink));
        assert!(notifier.unsubscribe(&id));
        assert!(!notifier.unsubscribe(&id));

        store.create(draft("x")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_updates_reach_subscribers_in_commit_order() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let role = store.create(draft("start")).unwrap();

        // Registered ahead of the notifier; stalls the first commit's delivery.
        let stalled = Arc::new(AtomicBool::new(false));
        store.add_on_change_listener(Arc::new(move |_event: &ChangeEvent<AgentRole>| {
            if !stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }));
        let notifier = ChangeNotifier::attach(store.clone(), DEFAULT_QUEUE_CAPACITY);
        let (sink, mut rx) = ChannelSink::channel(16);
        notifier.subscribe(Arc::new(sink));

        let writer = store.clone();
        let id = role.id.clone();
        tokio::task::spawn_blocking(move || {
            let rename = |name: &'static str| {
                let store = writer.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    let patch = AgentRolePatch { name: Some(name.into()), ..Default::default() };
                    store.update(&id, patch).unwrap();
                })
            };
            let first = rename("first");
            std::thread::sleep(Duration::from_millis(50));
            let second = rename("second");
            first.join().unwrap();
            second.join().unwrap();
        })
        .await
        .unwrap();

        let mut names = Vec::new();
        for _ in 0..2 {
            let n = next(&mut rx).await;
            names.push(n.record.as_ref().unwrap()["name"].as_str().unwrap().to_string());
        }
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(store.get(&role.id).unwrap().name, "second");
        assert_eq!(notifier.dropped_events(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking_the_store() {
        let tmp = tempdir().unwrap();
        let store = Arc::new(DurableStore::<AgentRole>::open(tmp.path()).unwrap());
        let notifier = ChangeNotifier::attach(store.clone(), 1);
        let (sink, mut rx) = ChannelSink::channel(16);
        notifier.subscribe(Arc::new(sink));

        // The current-thread runtime cannot run the dispatcher until we yield.
        let first = store.create(draft("first")).unwrap();
        for i in 0..4 {
            store.create(draft(&format!("extra-{i}"))).unwrap();
        }
        assert_eq!(notifier.dropped_events(), 4);
        assert_eq!(store.list().len(), 5);

        let n = next(&mut rx).await;
        assert_eq!(n.record.as_ref().unwrap()["id"], first.id.as_str());
    }
}
