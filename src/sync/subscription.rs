//! One change-feed registration per scope key.
//!
//! Every handle is driven by a pump task that owns the transport
//! subscription: it opens it, forwards events to a [`FeedSink`], reopens it
//! with backoff after a disconnect and unregisters it on teardown. Handle
//! state is published on a watch channel:
//! `Closed -> Opening -> Open -> Closing -> Closed`.

use crate::domain_model::*;
use crate::domain_port::*;
use crate::sync::retry::Backoff;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Receives what the pump reads from the transport. `epoch` identifies the
/// activation that opened the handle, so receivers can drop late callbacks.
#[async_trait::async_trait]
pub trait FeedSink: Send + Sync {
    async fn on_change(&self, scope: ScopeKey, epoch: u64, event: ChangeEvent);
    /// The handle was reopened after a disconnect; events may have been missed.
    async fn on_resubscribed(&self, scope: ScopeKey, epoch: u64);
    async fn on_reconcile_due(&self, scope: ScopeKey, epoch: u64);
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionConfig {
    pub reconnect: Backoff,
    pub teardown_timeout: Duration,
    pub reconcile_interval: Option<Duration>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect: Backoff::default(),
            teardown_timeout: Duration::from_secs(2),
            reconcile_interval: None,
        }
    }
}

struct ActiveSubscription {
    epoch: u64,
    cancel: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    transport: watch::Receiver<Option<SubscriptionId>>,
    pump: JoinHandle<()>,
}

pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    config: SubscriptionConfig,
    active: HashMap<ScopeKey, ActiveSubscription>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: SubscriptionConfig) -> Self {
        Self {
            feed,
            config,
            active: HashMap::new(),
        }
    }

    /// Opens a handle for `scope`. A handle already open for the same scope
    /// and epoch is reused; one from another epoch is closed first.
    pub async fn open(
        &mut self,
        scope: ScopeKey,
        epoch: u64,
        sink: Arc<dyn FeedSink>,
    ) -> watch::Receiver<SubscriptionState> {
        if let Some(existing) = self.active.get(&scope) {
            if existing.epoch == epoch && !existing.pump.is_finished() {
                return existing.state.clone();
            }
            self.close(&scope).await;
        }

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Opening);
        let (transport_tx, transport) = watch::channel(None);
        let pump = tokio::spawn(pump(
            self.feed.clone(),
            scope,
            epoch,
            sink,
            self.config,
            cancel.clone(),
            PumpState {
                state: state_tx,
                transport: transport_tx,
            },
        ));

        tracing::debug!(%scope, epoch, "subscription handle created");
        self.active.insert(
            scope,
            ActiveSubscription {
                epoch,
                cancel,
                state: state_rx.clone(),
                transport,
                pump,
            },
        );
        state_rx
    }

    /// Tears the handle down and waits for the transport to be unregistered,
    /// bounded by the teardown timeout. Returns false if no handle existed.
    pub async fn close(&mut self, scope: &ScopeKey) -> bool {
        let Some(sub) = self.active.remove(scope) else {
            return false;
        };
        sub.cancel.cancel();

        let mut pump = sub.pump;
        match tokio::time::timeout(self.config.teardown_timeout, &mut pump).await {
            Ok(Ok(())) => tracing::debug!(%scope, "subscription closed"),
            Ok(Err(e)) => tracing::error!(%scope, error = %e, "subscription pump failed"),
            Err(_) => {
                tracing::warn!(%scope, "subscription teardown timed out, aborting pump");
                pump.abort();
                let registered = *sub.transport.borrow();
                if let Some(id) = registered {
                    unsubscribe(self.feed.as_ref(), scope, id).await;
                }
            }
        }
        true
    }

    pub async fn close_all(&mut self) {
        let scopes: Vec<ScopeKey> = self.active.keys().copied().collect();
        for scope in scopes {
            self.close(&scope).await;
        }
    }

    pub fn state(&self, scope: &ScopeKey) -> SubscriptionState {
        self.active
            .get(scope)
            .map(|sub| *sub.state.borrow())
            .unwrap_or(SubscriptionState::Closed)
    }

    pub fn is_active(&self, scope: &ScopeKey) -> bool {
        self.active.contains_key(scope)
    }

    pub fn scopes(&self) -> Vec<ScopeKey> {
        self.active.keys().copied().collect()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for sub in self.active.values() {
            sub.cancel.cancel();
        }
    }
}

/// Waits until the handle reports `Open`. Returns false on timeout or when
/// the handle went away.
pub async fn wait_open(mut state: watch::Receiver<SubscriptionState>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, state.wait_for(|s| *s == SubscriptionState::Open)).await,
        Ok(Ok(_))
    )
}

/// What a pump publishes to its handle: the lifecycle state and the
/// transport registration it currently holds.
struct PumpState {
    state: watch::Sender<SubscriptionState>,
    transport: watch::Sender<Option<SubscriptionId>>,
}

async fn pump(
    feed: Arc<dyn ChangeFeed>,
    scope: ScopeKey,
    epoch: u64,
    sink: Arc<dyn FeedSink>,
    config: SubscriptionConfig,
    cancel: CancellationToken,
    published: PumpState,
) {
    let PumpState { state, transport } = published;
    let feed_scope = FeedScope::for_scope(&scope);
    let mut reconcile = config
        .reconcile_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut attempt = 0u32;
    let mut opened_before = false;

    'transport: loop {
        state.send_replace(SubscriptionState::Opening);
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'transport,
            r = feed.subscribe(feed_scope.clone()) => r,
        };

        let mut sub = match subscribed {
            Ok(sub) => sub,
            Err(e) => {
                let delay = config.reconnect.delay(attempt);
                attempt += 1;
                tracing::warn!(%scope, error = %e, ?delay, "subscribe failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'transport,
                    _ = tokio::time::sleep(delay) => continue 'transport,
                }
            }
        };

        attempt = 0;
        transport.send_replace(Some(sub.id));
        state.send_replace(SubscriptionState::Open);
        tracing::info!(%scope, id = %sub.id, "subscription open");
        if opened_before {
            sink.on_resubscribed(scope, epoch).await;
        }
        opened_before = true;

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state.send_replace(SubscriptionState::Closing);
                    unsubscribe(feed.as_ref(), &scope, sub.id).await;
                    transport.send_replace(None);
                    break 'transport;
                }
                _ = next_tick(&mut reconcile) => {
                    sink.on_reconcile_due(scope, epoch).await;
                }
                signal = sub.events.next() => match signal {
                    Some(FeedSignal::Change(event)) => sink.on_change(scope, epoch, event).await,
                    Some(FeedSignal::Disconnected(reason)) => break reason,
                    None => break "stream ended".to_owned(),
                },
            }
        };

        tracing::warn!(%scope, %reason, "subscription dropped, reopening");
        unsubscribe(feed.as_ref(), &scope, sub.id).await;
        transport.send_replace(None);
        state.send_replace(SubscriptionState::Opening);

        let delay = config.reconnect.delay(attempt);
        attempt += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'transport,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(SubscriptionState::Closed);
    tracing::debug!(%scope, epoch, "subscription pump finished");
}

async fn unsubscribe(feed: &dyn ChangeFeed, scope: &ScopeKey, id: SubscriptionId) {
    if let Err(e) = feed.unsubscribe(id).await {
        tracing::debug!(%scope, %id, error = %e, "unsubscribe failed");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct TestFeed {
        next_id: AtomicU64,
        fail_next: AtomicU32,
        senders: Mutex<Vec<mpsc::UnboundedSender<FeedSignal>>>,
        unsubscribed: Mutex<Vec<SubscriptionId>>,
    }

    impl TestFeed {
        fn push(&self, signal: FeedSignal) {
            let senders = self.senders.lock().unwrap();
            if let Some(tx) = senders.last() {
                let _ = tx.send(signal);
            }
        }

        fn subscriptions(&self) -> usize {
            self.senders.lock().unwrap().len()
        }

        fn unsubscriptions(&self) -> usize {
            self.unsubscribed.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ChangeFeed for TestFeed {
        async fn subscribe(&self, _scope: FeedScope) -> Result<FeedSubscription, FeedError> {
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FeedError::Unavailable("offline".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            let events = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|signal| (signal, rx))
            })
            .boxed();
            Ok(FeedSubscription {
                id: SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst)),
                events,
            })
        }

        async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), FeedError> {
            self.unsubscribed.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Change(u64),
        Resubscribed(u64),
    }

    struct TestSink(mpsc::UnboundedSender<Seen>);

    #[async_trait::async_trait]
    impl FeedSink for TestSink {
        async fn on_change(&self, _scope: ScopeKey, epoch: u64, _event: ChangeEvent) {
            let _ = self.0.send(Seen::Change(epoch));
        }

        async fn on_resubscribed(&self, _scope: ScopeKey, epoch: u64) {
            let _ = self.0.send(Seen::Resubscribed(epoch));
        }

        async fn on_reconcile_due(&self, _scope: ScopeKey, _epoch: u64) {}
    }

    fn config() -> SubscriptionConfig {
        SubscriptionConfig {
            reconnect: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            teardown_timeout: Duration::from_secs(1),
            reconcile_interval: None,
        }
    }

    fn scope() -> ScopeKey {
        ScopeKey::direct(UserId::from_handle("a"), UserId::from_handle("b"))
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new(ChangeKind::Insert, MESSAGES_TABLE, json!({}))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sink timed out")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn open_forward_close() {
        let feed = Arc::new(TestFeed::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(feed.clone(), config());

        let state = manager.open(scope(), 7, Arc::new(TestSink(tx))).await;
        assert!(wait_open(state, Duration::from_secs(1)).await);
        assert_eq!(manager.state(&scope()), SubscriptionState::Open);

        feed.push(FeedSignal::Change(event()));
        assert_eq!(next(&mut rx).await, Seen::Change(7));

        assert!(manager.close(&scope()).await);
        assert_eq!(manager.state(&scope()), SubscriptionState::Closed);
        assert_eq!(feed.unsubscriptions(), 1);
        assert!(!manager.close(&scope()).await);
    }

    #[tokio::test]
    async fn disconnect_reopens_same_scope() {
        let feed = Arc::new(TestFeed::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(feed.clone(), config());
        let state = manager.open(scope(), 1, Arc::new(TestSink(tx))).await;
        assert!(wait_open(state, Duration::from_secs(1)).await);

        feed.push(FeedSignal::Disconnected("network".into()));
        assert_eq!(next(&mut rx).await, Seen::Resubscribed(1));
        assert_eq!(feed.subscriptions(), 2);

        feed.push(FeedSignal::Change(event()));
        assert_eq!(next(&mut rx).await, Seen::Change(1));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn failed_subscribe_is_retried() {
        let feed = Arc::new(TestFeed::default());
        feed.fail_next.store(2, Ordering::SeqCst);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(feed.clone(), config());

        let state = manager.open(scope(), 1, Arc::new(TestSink(tx))).await;
        assert!(wait_open(state, Duration::from_secs(1)).await);
        assert_eq!(feed.subscriptions(), 1);
        manager.close_all().await;
    }

    struct StuckSink;

    #[async_trait::async_trait]
    impl FeedSink for StuckSink {
        async fn on_change(&self, _scope: ScopeKey, _epoch: u64, _event: ChangeEvent) {
            std::future::pending::<()>().await
        }

        async fn on_resubscribed(&self, _scope: ScopeKey, _epoch: u64) {}

        async fn on_reconcile_due(&self, _scope: ScopeKey, _epoch: u64) {}
    }

    #[tokio::test]
    async fn aborted_teardown_still_unregisters() {
        let feed = Arc::new(TestFeed::default());
        let mut manager = SubscriptionManager::new(
            feed.clone(),
            SubscriptionConfig {
                teardown_timeout: Duration::from_millis(20),
                ..config()
            },
        );

        let state = manager.open(scope(), 1, Arc::new(StuckSink)).await;
        assert!(wait_open(state, Duration::from_secs(1)).await);
        feed.push(FeedSignal::Change(event()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.close(&scope()).await);
        assert_eq!(*feed.unsubscribed.lock().unwrap(), vec![SubscriptionId(0)]);
        assert!(manager.scopes().is_empty());
    }

    #[tokio::test]
    async fn reopening_with_new_epoch_replaces_handle() {
        let feed = Arc::new(TestFeed::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FeedSink> = Arc::new(TestSink(tx));
        let mut manager = SubscriptionManager::new(feed.clone(), config());

        let first = manager.open(scope(), 1, sink.clone()).await;
        assert!(wait_open(first, Duration::from_secs(1)).await);
        let second = manager.open(scope(), 2, sink).await;
        assert!(wait_open(second, Duration::from_secs(1)).await);

        assert_eq!(feed.unsubscriptions(), 1);
        assert_eq!(manager.scopes(), vec![scope()]);
        feed.push(FeedSignal::Change(event()));
        assert_eq!(next(&mut rx).await, Seen::Change(2));
        manager.close_all().await;
    }
}
