use crate::application_impl::SyncPorts;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::*;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

struct Subscriber {
    viewer: UserId,
    scope: FeedScope,
    tx: mpsc::UnboundedSender<FeedSignal>,
}

#[derive(Debug)]
struct Faults {
    reject_inserts: AtomicBool,
    echo_inserts: AtomicBool,
    duplicate_events: AtomicBool,
    failing_updates: AtomicU32,
}

#[derive(Debug, Default)]
struct Counters {
    inserts: AtomicUsize,
    updates: AtomicUsize,
    queries: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    waiting_queries: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub inserts: usize,
    pub updates: usize,
    pub queries: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
}

/// In-process stand-in for the hosted backend: message rows with
/// row-level visibility, profiles, group membership, blobs and a change
/// feed with at-least-once delivery. Every identity gets its own view
/// through [`MemoryDatabase::ports_for`].
pub struct MemoryDatabase {
    rows: Mutex<Vec<MessageRow>>,
    profiles: DashMap<UserId, Profile>,
    groups: DashMap<GroupId, HashSet<UserId>>,
    blobs: DashMap<String, Vec<u8>>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_subscription: AtomicU64,
    online: watch::Sender<bool>,
    held_history: watch::Sender<HashSet<UserId>>,
    faults: Faults,
    counters: Counters,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        let (online, _) = watch::channel(true);
        let (held_history, _) = watch::channel(HashSet::new());
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            profiles: DashMap::new(),
            groups: DashMap::new(),
            blobs: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            online,
            held_history,
            faults: Faults {
                reject_inserts: AtomicBool::new(false),
                echo_inserts: AtomicBool::new(true),
                duplicate_events: AtomicBool::new(false),
                failing_updates: AtomicU32::new(0),
            },
            counters: Counters::default(),
        })
    }

    /// Ports as seen by `user`.
    pub fn ports_for(self: &Arc<Self>, user: UserId) -> SyncPorts {
        SyncPorts {
            session: Arc::new(FixedSessionProvider::signed_in(user)),
            messages: Arc::new(MemoryMessageRepo::new(self.clone(), user)),
            profiles: Arc::new(MemoryProfileRepo::new(self.clone())),
            feed: Arc::new(MemoryChangeFeed::new(self.clone(), user)),
            blobs: Arc::new(MemoryBlobStore::new(self.clone())),
        }
    }

    pub fn add_profile(&self, profile: Profile) {
        self.profiles.insert(profile.id, profile);
    }

    /// Registers a user by handle and returns its profile.
    pub fn add_user(&self, handle: &str) -> Profile {
        let profile = Profile::new(UserId::from_handle(handle), handle);
        self.add_profile(profile.clone());
        profile
    }

    pub fn add_group(&self, group: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.groups.insert(group, members.into_iter().collect());
    }

    // region faults

    /// While offline, inserts wait for the connection to come back and
    /// subscribe attempts fail.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
        tracing::debug!(online, "memory backend connectivity changed");
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Every insert is refused as if row-level security denied it.
    pub fn set_reject_inserts(&self, reject: bool) {
        self.faults.reject_inserts.store(reject, Ordering::SeqCst);
    }

    /// Whether inserts return the stored row or only reach clients through the feed.
    pub fn set_echo_inserts(&self, echo: bool) {
        self.faults.echo_inserts.store(echo, Ordering::SeqCst);
    }

    /// Deliver every feed event twice.
    pub fn set_duplicate_events(&self, duplicate: bool) {
        self.faults.duplicate_events.store(duplicate, Ordering::SeqCst);
    }

    pub fn fail_next_updates(&self, count: u32) {
        self.faults.failing_updates.store(count, Ordering::SeqCst);
    }

    /// History queries of conversations involving `user` block until released.
    pub fn hold_history(&self, user: UserId) {
        self.held_history.send_modify(|held| {
            held.insert(user);
        });
    }

    pub fn release_history(&self, user: UserId) {
        self.held_history.send_modify(|held| {
            held.remove(&user);
        });
    }

    /// Queries currently blocked by [`MemoryDatabase::hold_history`].
    pub fn waiting_queries(&self) -> usize {
        self.counters.waiting_queries.load(Ordering::SeqCst)
    }

    /// Simulates a transport drop on every open subscription.
    pub fn drop_connections(&self) {
        let ids: Vec<SubscriptionId> = self.subscribers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, subscriber)) = self.subscribers.remove(&id) {
                let _ = subscriber
                    .tx
                    .send(FeedSignal::Disconnected("connection reset".to_owned()));
            }
        }
        tracing::debug!("memory backend dropped all subscriptions");
    }

    // endregion

    // region inspection

    pub fn stats(&self) -> DatabaseStats {
        let c = &self.counters;
        DatabaseStats {
            inserts: c.inserts.load(Ordering::SeqCst),
            updates: c.updates.load(Ordering::SeqCst),
            queries: c.queries.load(Ordering::SeqCst),
            subscribes: c.subscribes.load(Ordering::SeqCst),
            unsubscribes: c.unsubscribes.load(Ordering::SeqCst),
        }
    }

    pub fn rows(&self) -> Vec<MessageRow> {
        self.lock_rows().clone()
    }

    pub fn row(&self, id: MessageId) -> Option<MessageRow> {
        self.lock_rows().iter().find(|r| r.id == id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.get(path).map(|b| b.value().clone())
    }

    // endregion

    // region storage

    pub(crate) async fn query(
        &self,
        viewer: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        if let MessageFilter::Between(pair) = query.filter {
            self.wait_released(pair).await;
        }

        let mut rows: Vec<MessageRow> = self
            .lock_rows()
            .iter()
            .filter(|r| self.visible(viewer, r) && query.filter.matches(r))
            .cloned()
            .collect();

        // newest first, then cut to the limit
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if query.order == SortOrder::Ascending {
            rows.reverse();
        }
        Ok(rows)
    }

    pub(crate) async fn insert(
        &self,
        viewer: UserId,
        new: &NewMessageRow,
    ) -> Result<InsertOutcome, StoreError> {
        let mut online = self.online.subscribe();
        let _ = online.wait_for(|online| *online).await;

        if self.faults.reject_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(
                "new row violates row-level security policy".to_owned(),
            ));
        }
        if new.sender_id != viewer {
            return Err(StoreError::PermissionDenied(
                "sender must be the authenticated user".to_owned(),
            ));
        }
        match (new.receiver_id, new.group_id) {
            (Some(_), None) => {}
            (None, Some(group)) if self.is_member(group, viewer) => {}
            (None, Some(_)) => {
                return Err(StoreError::PermissionDenied("not a group member".to_owned()));
            }
            _ => {
                return Err(StoreError::Invalid(
                    "exactly one of receiver_id and group_id is required".to_owned(),
                ));
            }
        }

        let row = MessageRow {
            id: MessageId(uuid::Uuid::new_v4()),
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            group_id: new.group_id,
            content: new.content.clone(),
            message_type: new.message_type,
            media_url: new.media_url.clone(),
            created_at: Utc::now(),
            delivered_at: None,
            seen_at: None,
        };
        self.lock_rows().push(row.clone());
        self.counters.inserts.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id = %row.id, "row inserted");

        self.publish(ChangeKind::Insert, &row);
        if self.faults.echo_inserts.load(Ordering::SeqCst) {
            Ok(InsertOutcome::Echoed(row))
        } else {
            Ok(InsertOutcome::Accepted)
        }
    }

    /// Only rows addressed to `viewer` can be acknowledged.
    pub(crate) async fn update(
        &self,
        viewer: UserId,
        patch: MessagePatch,
        filter: &UpdateFilter,
    ) -> Result<usize, StoreError> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .faults
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Timeout);
        }

        let changed: Vec<MessageRow> = {
            let mut rows = self.lock_rows();
            rows.iter_mut()
                .filter(|r| r.receiver_id == Some(viewer) && filter.matches(r))
                .filter_map(|r| patch.apply(r).then(|| r.clone()))
                .collect()
        };
        for row in &changed {
            self.publish(ChangeKind::Update, row);
        }
        Ok(changed.len())
    }

    pub(crate) fn profiles(&self, ids: &[UserId]) -> Vec<Profile> {
        ids.iter()
            .filter_map(|id| self.profiles.get(id).map(|p| p.value().clone()))
            .collect()
    }

    pub(crate) fn store_blob(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> String {
        let key = format!("{bucket}/{path}");
        self.blobs.insert(key.clone(), bytes);
        format!("memory://{key}")
    }

    // endregion

    // region feed

    pub(crate) fn subscribe(
        &self,
        viewer: UserId,
        scope: FeedScope,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<FeedSignal>), FeedError> {
        if !self.is_online() {
            return Err(FeedError::Unavailable("backend offline".to_owned()));
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(%id, channel = %scope.channel, "subscriber registered");
        self.subscribers.insert(id, Subscriber { viewer, scope, tx });
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok((id, rx))
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers.remove(&id).is_some() {
            self.counters.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn publish(&self, kind: ChangeKind, row: &MessageRow) {
        let payload = match serde_json::to_value(row) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(id = %row.id, error = %e, "row not serializable");
                return;
            }
        };
        let event = ChangeEvent::new(kind, MESSAGES_TABLE, payload);
        let copies = if self.faults.duplicate_events.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !self.visible(subscriber.viewer, row) || !subscriber.scope.matches(&event) {
                continue;
            }
            for _ in 0..copies {
                if subscriber.tx.send(FeedSignal::Change(event.clone())).is_err() {
                    closed.push(*entry.key());
                    break;
                }
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    // endregion

    fn lock_rows(&self) -> MutexGuard<'_, Vec<MessageRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_member(&self, group: GroupId, user: UserId) -> bool {
        self.groups
            .get(&group)
            .is_some_and(|members| members.contains(&user))
    }

    fn visible(&self, viewer: UserId, row: &MessageRow) -> bool {
        row.sender_id == viewer
            || row.receiver_id == Some(viewer)
            || row.group_id.is_some_and(|g| self.is_member(g, viewer))
    }

    async fn wait_released(&self, pair: UserPair) {
        let mut held = self.held_history.subscribe();
        let blocked = |held: &HashSet<UserId>| held.contains(&pair.first()) || held.contains(&pair.second());
        let is_blocked = {
            let current = held.borrow_and_update();
            blocked(&*current)
        };
        if !is_blocked {
            return;
        }
        self.counters.waiting_queries.fetch_add(1, Ordering::SeqCst);
        let _ = held.wait_for(|held| !blocked(held)).await;
        self.counters.waiting_queries.fetch_sub(1, Ordering::SeqCst);
    }
}
