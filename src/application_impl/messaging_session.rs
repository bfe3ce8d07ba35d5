use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::sync::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const MEDIA_BUCKET: &str = "messages";
const INBOX_EPOCH: u64 = 0;

/// Delivered-ack ids claimed by a write in progress. They go back to the
/// pool unless the write settles, including when the task is dropped.
struct AckClaim<'a> {
    inner: &'a SessionInner,
    ids: Vec<MessageId>,
    settled: bool,
}

impl Drop for AckClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.lock().delivered.release(&self.ids);
        }
    }
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SyncPorts {
    pub session: Arc<dyn SessionProvider>,
    pub messages: Arc<dyn MessageRepo>,
    pub profiles: Arc<dyn ProfileRepo>,
    pub feed: Arc<dyn ChangeFeed>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Everything that belongs to the conversation currently on screen.
struct Activation {
    epoch: u64,
    scope: ScopeKey,
    recipient: Recipient,
    cancel: CancellationToken,
    normalizer: EventNormalizer,
    store: MergeStore,
    tracker: SendTracker,
    seen: SeenBatcher,
}

struct SessionState {
    epoch: u64,
    active: Option<Activation>,
    profiles: ProfileIndex,
    directory: ConversationDirectory,
    delivered: DeliveredAcks,
    disposed: bool,
}

impl SessionState {
    fn current(&mut self, epoch: u64) -> Option<&mut Activation> {
        self.active.as_mut().filter(|a| a.epoch == epoch)
    }
}

struct SessionInner {
    me: Profile,
    ports: SyncPorts,
    config: SyncConfig,
    inbox: EventNormalizer,
    state: Mutex<SessionState>,
    subscriptions: tokio::sync::Mutex<SubscriptionManager>,
    listeners: DashMap<ListenerId, StoreListener>,
    next_listener: AtomicU64,
    revision: watch::Sender<u64>,
}

/// Message synchronization for one signed-in identity.
///
/// All state sits behind a mutex that is never held across an await, so
/// every handler runs to completion between suspension points. Results of
/// async work are applied only if the activation that started it is still
/// the current one.
pub struct MessagingSession {
    inner: Arc<SessionInner>,
}

impl MessagingSession {
    pub async fn connect(ports: SyncPorts, config: SyncConfig) -> Result<Self, SyncError> {
        let me_id = ports
            .session
            .current_identity()
            .await
            .ok_or(SyncError::NotAuthenticated)?;

        let me = match ports
            .profiles
            .get_profiles(&[me_id])
            .await?
            .into_iter()
            .find(|p| p.id == me_id)
        {
            Some(profile) => profile,
            None => {
                tracing::warn!(user = %me_id, "no profile for the current identity");
                Profile::new(me_id, &me_id.to_string())
            }
        };

        let mut profiles = ProfileIndex::default();
        profiles.insert(me.clone());
        let (revision, _) = watch::channel(0);
        let inbox = ScopeKey::Inbox(me_id);

        let inner = Arc::new(SessionInner {
            inbox: EventNormalizer::new(me.clone(), inbox, None),
            state: Mutex::new(SessionState {
                epoch: INBOX_EPOCH,
                active: None,
                profiles,
                directory: ConversationDirectory::new(me_id),
                delivered: DeliveredAcks::default(),
                disposed: false,
            }),
            subscriptions: tokio::sync::Mutex::new(SubscriptionManager::new(
                ports.feed.clone(),
                config.subscription,
            )),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            revision,
            me,
            ports,
            config,
        });

        let opened = inner
            .subscriptions
            .lock()
            .await
            .open(inbox, INBOX_EPOCH, inner.sink())
            .await;
        if !wait_open(opened, config.open_timeout).await {
            tracing::warn!(%inbox, "inbox subscription not open yet");
        }

        tracing::info!(user = %me_id, "messaging session connected");
        Ok(Self { inner })
    }

    pub fn me(&self) -> &Profile {
        &self.inner.me
    }

    /// Scopes that currently hold a change-feed registration.
    pub async fn subscribed_scopes(&self) -> Vec<ScopeKey> {
        self.inner.subscriptions.lock().await.scopes()
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(self: &Arc<Self>) -> Arc<dyn FeedSink> {
        Arc::new(SessionSink(Arc::downgrade(self)))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().active.as_ref().is_some_and(|a| a.epoch == epoch)
    }

    fn notify(&self, change: StoreChange) {
        self.revision.send_modify(|r| *r += 1);
        let listeners: Vec<StoreListener> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener(change);
        }
    }

    async fn profile(&self, id: UserId) -> Option<Profile> {
        let cached = self.lock().profiles.get(id).cloned();
        if cached.is_some() {
            return cached;
        }
        match self.ports.profiles.get_profiles(&[id]).await {
            Ok(found) => {
                let profile = found.into_iter().find(|p| p.id == id)?;
                self.lock().profiles.insert(profile.clone());
                Some(profile)
            }
            Err(e) => {
                tracing::warn!(user = %id, error = %e, "profile lookup failed");
                None
            }
        }
    }

    async fn activate(
        self: &Arc<Self>,
        scope: ScopeKey,
        recipient: Recipient,
    ) -> Result<(), SyncError> {
        let partner = match recipient {
            Recipient::Direct(partner) => self.profile(partner).await,
            Recipient::Group(_) => None,
        };

        let (epoch, cancel, previous) = {
            let mut state = self.lock();
            if state.disposed {
                return Err(SyncError::Disposed);
            }
            if state.active.as_ref().is_some_and(|a| a.scope == scope) {
                tracing::debug!(%scope, "conversation already active");
                return Ok(());
            }

            state.epoch += 1;
            let epoch = state.epoch;
            let previous = state.active.take().map(|prev| {
                prev.cancel.cancel();
                prev.scope
            });
            let cancel = CancellationToken::new();
            state.active = Some(Activation {
                epoch,
                scope,
                recipient,
                cancel: cancel.clone(),
                normalizer: EventNormalizer::new(self.me.clone(), scope, partner),
                store: MergeStore::new(),
                tracker: SendTracker::new(self.me.clone(), self.config.echo_window),
                seen: SeenBatcher::default(),
            });
            (epoch, cancel, previous)
        };
        tracing::info!(%scope, epoch, "conversation activated");
        self.notify(StoreChange::Messages);

        let opened = {
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(previous) = previous {
                subscriptions.close(&previous).await;
            }
            if !self.is_current(epoch) {
                return Err(SyncError::Superseded);
            }
            subscriptions.open(scope, epoch, self.sink()).await
        };
        if !wait_open(opened, self.config.open_timeout).await {
            tracing::warn!(%scope, "subscription not open yet, loading history anyway");
        }

        self.load_history(epoch, &cancel).await.map(|_| ())
    }

    async fn deactivate(&self) {
        let previous = {
            let mut state = self.lock();
            state.epoch += 1;
            state.active.take()
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
            self.subscriptions.lock().await.close(&previous.scope).await;
            tracing::info!(scope = %previous.scope, "conversation deactivated");
            self.notify(StoreChange::Messages);
        }
    }

    async fn load_history(
        self: &Arc<Self>,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        let scope = match self.lock().current(epoch) {
            Some(active) => active.scope,
            None => return Err(SyncError::Superseded),
        };
        let Some(query) = MessageQuery::history(&scope, self.config.history_limit) else {
            return Ok(0);
        };

        let rows = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Superseded),
            rows = retry_transient(
                self.config.write_backoff,
                self.config.send_attempts,
                "history load",
                || self.ports.messages.query(&query),
            ) => rows?,
        };

        let now = Utc::now();
        let (changed, acks, missing, directory_changed) = {
            let mut state = self.lock();
            let SessionState {
                active,
                profiles,
                directory,
                delivered,
                ..
            } = &mut *state;
            let Some(active) = active.as_mut().filter(|a| a.epoch == epoch) else {
                tracing::debug!(%scope, epoch, "discarding stale history");
                return Err(SyncError::Superseded);
            };

            let mut history = Vec::with_capacity(rows.len());
            for row in rows {
                match active.normalizer.message_from_row(row, profiles) {
                    Ok(message) => history.push(message),
                    Err(rejection) => tracing::debug!(%scope, %rejection, "history row dropped"),
                }
            }
            let unknown: Vec<UserId> = history
                .iter()
                .filter(|m| m.sender_profile.is_none())
                .map(|m| m.sender)
                .collect();

            let acks = delivered.take_unacked(self.me.id, &history);

            // own rows whose echo was missed still stand behind a pending entry
            let mut replaced = 0;
            let mut rest = Vec::with_capacity(history.len());
            for message in history {
                match active.tracker.match_echo(&message) {
                    Some(local_id) => {
                        tracing::debug!(%local_id, key = %message.key, "history row replaces pending send");
                        active.store.replace(&local_id, message);
                        replaced += 1;
                    }
                    None => rest.push(message),
                }
            }
            let changed = active.store.load(rest) + replaced;
            active.store.mark_delivered(&acks, now);
            let directory_changed = active.store.last().is_some_and(|last| directory.observe(last));
            (changed, acks, profiles.claim_missing(unknown), directory_changed)
        };
        tracing::debug!(%scope, changed, "history merged");

        if !acks.is_empty() {
            self.ack_delivered(acks, now).await;
        }
        if !missing.is_empty() {
            self.warm_profiles(missing);
        }
        self.notify(StoreChange::Messages);
        if directory_changed {
            self.notify(StoreChange::Conversations);
        }
        Ok(changed)
    }

    async fn handle_change(self: &Arc<Self>, scope: ScopeKey, epoch: u64, event: ChangeEvent) {
        if let ScopeKey::Inbox(_) = scope {
            return self.handle_inbox(event).await;
        }

        let now = Utc::now();
        let (acks, missing, directory_changed) = {
            let mut state = self.lock();
            let SessionState {
                active,
                profiles,
                directory,
                delivered,
                ..
            } = &mut *state;
            let Some(active) = active.as_mut().filter(|a| a.epoch == epoch) else {
                tracing::debug!(%scope, epoch, "event for a stale activation dropped");
                return;
            };

            match active.normalizer.normalize(&event, profiles) {
                Normalized::Rejected(rejection) => {
                    tracing::debug!(%scope, %rejection, "event dropped");
                    return;
                }
                Normalized::Update(message) => {
                    if !active.store.apply_update(message).changed() {
                        return;
                    }
                    (Vec::new(), Vec::new(), false)
                }
                Normalized::Insert(message) => {
                    let missing = match message.sender_profile {
                        Some(_) => Vec::new(),
                        None => profiles.claim_missing([message.sender]),
                    };
                    let directory_changed = directory.observe(&message);
                    let acks = delivered.take_unacked(self.me.id, [&message]);
                    match active.tracker.match_echo(&message) {
                        Some(local_id) => {
                            tracing::debug!(%local_id, key = %message.key, "echo replaces pending send");
                            active.store.replace(&local_id, message);
                        }
                        None => {
                            active.store.append(message);
                        }
                    }
                    active.store.mark_delivered(&acks, now);
                    (acks, missing, directory_changed)
                }
            }
        };

        if !acks.is_empty() {
            self.ack_delivered(acks, now).await;
        }
        if !missing.is_empty() {
            self.warm_profiles(missing);
        }
        self.notify(StoreChange::Messages);
        if directory_changed {
            self.notify(StoreChange::Conversations);
        }
    }

    /// Inserts addressed to this user from any partner. Feeds the directory
    /// and acknowledges delivery for partners whose conversation is not open.
    async fn handle_inbox(self: &Arc<Self>, event: ChangeEvent) {
        let now = Utc::now();
        let (acks, missing) = {
            let mut state = self.lock();
            let SessionState {
                active,
                profiles,
                directory,
                delivered,
                ..
            } = &mut *state;

            let message = match self.inbox.normalize(&event, profiles) {
                Normalized::Insert(message) => message,
                Normalized::Update(_) => return,
                Normalized::Rejected(rejection) => {
                    tracing::debug!(%rejection, "inbox event dropped");
                    return;
                }
            };

            directory.observe(&message);
            // the open conversation's handle acknowledges its own partner
            let covered = active
                .as_ref()
                .is_some_and(|a| a.scope == ScopeKey::direct(self.me.id, message.sender));
            let acks = if covered {
                Vec::new()
            } else {
                delivered.take_unacked(self.me.id, [&message])
            };
            let missing = if message.sender_profile.is_none() {
                profiles.claim_missing([message.sender])
            } else {
                Vec::new()
            };
            (acks, missing)
        };

        if !acks.is_empty() {
            self.ack_delivered(acks, now).await;
        }
        if !missing.is_empty() {
            self.warm_profiles(missing);
        }
        self.notify(StoreChange::Conversations);
    }

    /// Reload after a gap in the change feed.
    async fn catch_up(self: &Arc<Self>, scope: ScopeKey, epoch: u64) {
        let result = match scope {
            ScopeKey::Inbox(_) => {
                if !self.lock().directory.is_loaded() {
                    return;
                }
                self.load_conversations().await.map(|c| c.len())
            }
            _ => {
                let cancel = match self.lock().current(epoch) {
                    Some(active) => active.cancel.clone(),
                    None => return,
                };
                self.load_history(epoch, &cancel).await
            }
        };
        match result {
            Ok(changed) => tracing::debug!(%scope, changed, "caught up"),
            Err(SyncError::Superseded) => {}
            Err(e) => tracing::warn!(%scope, error = %e, "catch-up failed"),
        }
    }

    async fn ack_delivered(&self, ids: Vec<MessageId>, at: DateTime<Utc>) {
        let filter = UpdateFilter::ids(ids.clone());
        let mut claim = AckClaim {
            inner: self,
            ids,
            settled: false,
        };
        let result = retry_transient(
            self.config.write_backoff,
            self.config.send_attempts,
            "delivered ack",
            || self.ports.messages.update(MessagePatch::delivered(at), &filter),
        )
        .await;
        match result {
            Ok(changed) => {
                claim.settled = true;
                tracing::debug!(count = claim.ids.len(), changed, "delivered acknowledged");
            }
            Err(e) => tracing::warn!(count = claim.ids.len(), error = %e, "delivered ack failed"),
        }
    }

    /// Fetches unknown sender profiles once in the background and patches
    /// every view that shows them.
    fn warm_profiles(self: &Arc<Self>, ids: Vec<UserId>) {
        let weak = Arc::downgrade(self);
        let profiles = self.ports.profiles.clone();
        tokio::spawn(async move {
            let result = profiles.get_profiles(&ids).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(found) => inner.attach_profiles(found),
                Err(e) => {
                    tracing::warn!(count = ids.len(), error = %e, "profile fetch failed");
                    inner.lock().profiles.release(&ids);
                }
            }
        });
    }

    fn attach_profiles(&self, found: Vec<Profile>) {
        if found.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            let SessionState {
                active,
                profiles,
                directory,
                ..
            } = &mut *state;
            if let Some(active) = active.as_mut() {
                for profile in &found {
                    if active.recipient == Recipient::Direct(profile.id) {
                        active.normalizer.set_partner(profile.clone());
                    }
                    active.store.attach_profile(profile);
                }
            }
            directory.attach_profiles(&found);
            profiles.extend(found);
        }
        self.notify(StoreChange::Messages);
        self.notify(StoreChange::Conversations);
    }

    async fn send(
        self: &Arc<Self>,
        content: &str,
        kind: MessageKind,
        media_url: Option<String>,
    ) -> Result<MessageKey, SyncError> {
        let content = content.trim();
        if content.is_empty() && media_url.is_none() {
            return Err(SyncError::EmptyMessage);
        }

        let (epoch, local_id, draft, directory_changed) = {
            let mut state = self.lock();
            let SessionState {
                active, directory, ..
            } = &mut *state;
            let active = active.as_mut().ok_or(SyncError::NoActiveConversation)?;
            let draft = Draft {
                recipient: active.recipient,
                content: content.to_owned(),
                kind,
                media_url,
            };
            let (local_id, message) = active.tracker.track(draft.clone(), Utc::now());
            let directory_changed = directory.observe(&message);
            active.store.append(message);
            (active.epoch, local_id, draft, directory_changed)
        };
        tracing::debug!(%local_id, "message queued");
        self.notify(StoreChange::Messages);
        if directory_changed {
            self.notify(StoreChange::Conversations);
        }

        self.write_send(epoch, local_id, draft).await
    }

    async fn write_send(
        &self,
        epoch: u64,
        local_id: LocalId,
        draft: Draft,
    ) -> Result<MessageKey, SyncError> {
        let row = draft.to_row(self.me.id);
        let result = retry_transient(
            self.config.write_backoff,
            self.config.send_attempts,
            "send",
            || self.ports.messages.insert(&row),
        )
        .await;

        let outcome = {
            let mut state = self.lock();
            let SessionState {
                active, profiles, ..
            } = &mut *state;
            let active = active.as_mut().filter(|a| a.epoch == epoch);
            settle_send(active, profiles, &local_id, result)
        };
        self.notify(StoreChange::Messages);
        outcome
    }

    async fn retry_send(&self, local_id: &LocalId) -> Result<MessageKey, SyncError> {
        let (epoch, draft) = {
            let mut state = self.lock();
            let active = state
                .active
                .as_mut()
                .ok_or(SyncError::NoActiveConversation)?;
            let draft = active
                .tracker
                .retry(local_id)
                .ok_or_else(|| SyncError::UnknownLocal(local_id.clone()))?;
            active.store.mark_pending(local_id);
            (active.epoch, draft)
        };
        tracing::info!(%local_id, "retrying send");
        self.notify(StoreChange::Messages);
        self.write_send(epoch, local_id.clone(), draft).await
    }

    async fn send_media(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        file_name: &str,
        caption: &str,
    ) -> Result<MessageKey, SyncError> {
        if self.lock().active.is_none() {
            return Err(SyncError::NoActiveConversation);
        }
        let path = format!(
            "{}/{}-{}",
            self.me.id,
            Utc::now().timestamp_millis(),
            file_name
        );
        let url = self
            .ports
            .blobs
            .upload(MEDIA_BUCKET, &path, bytes)
            .await?;
        tracing::debug!(%url, "media uploaded");
        self.send(caption, media_kind(file_name), Some(url)).await
    }

    async fn thread_rendered(&self) -> Result<usize, SyncError> {
        let mut total = 0;
        loop {
            let (epoch, batch) = {
                let mut state = self.lock();
                let active = state
                    .active
                    .as_mut()
                    .ok_or(SyncError::NoActiveConversation)?;
                let Recipient::Direct(partner) = active.recipient else {
                    return Ok(total);
                };
                let Some(batch) =
                    active
                        .seen
                        .begin(self.me.id, partner, active.store.iter(), Utc::now())
                else {
                    return Ok(total);
                };
                (active.epoch, batch)
            };

            // Not retried here; the next render pass tries again.
            let result = self
                .ports
                .messages
                .update(batch.patch(), &batch.filter())
                .await;

            let rerun = {
                let mut state = self.lock();
                let Some(active) = state.current(epoch) else {
                    return Ok(total);
                };
                let rerun = active.seen.finish();
                match &result {
                    Ok(changed) => {
                        total += changed;
                        active
                            .store
                            .mark_seen_incoming(batch.me, batch.partner, batch.at);
                    }
                    Err(e) => tracing::warn!(error = %e, "mark seen failed"),
                }
                rerun && result.is_ok()
            };
            self.notify(StoreChange::Messages);
            if !rerun {
                return Ok(total);
            }
        }
    }

    async fn load_conversations(self: &Arc<Self>) -> Result<Vec<ConversationSummary>, SyncError> {
        let query = MessageQuery::recent_for(self.me.id, self.config.directory_limit);
        let rows = retry_transient(
            self.config.write_backoff,
            self.config.send_attempts,
            "conversation load",
            || self.ports.messages.query(&query),
        )
        .await?;

        let claimed = {
            let mut state = self.lock();
            let SessionState {
                profiles,
                directory,
                ..
            } = &mut *state;
            directory.load(rows);
            let cached: Vec<Profile> = directory
                .missing_profiles()
                .into_iter()
                .filter_map(|id| profiles.get(id).cloned())
                .collect();
            directory.attach_profiles(&cached);
            profiles.claim_missing(directory.missing_profiles())
        };

        if !claimed.is_empty() {
            match self.ports.profiles.get_profiles(&claimed).await {
                Ok(found) => self.attach_profiles(found),
                Err(e) => {
                    tracing::warn!(error = %e, "partner profiles unavailable");
                    self.lock().profiles.release(&claimed);
                }
            }
        }
        self.notify(StoreChange::Conversations);
        Ok(self.lock().directory.summaries())
    }

    async fn reconcile(self: &Arc<Self>) -> Result<usize, SyncError> {
        let (epoch, cancel) = {
            let state = self.lock();
            let active = state
                .active
                .as_ref()
                .ok_or(SyncError::NoActiveConversation)?;
            (active.epoch, active.cancel.clone())
        };
        self.load_history(epoch, &cancel).await
    }

    async fn dispose(&self) {
        let previous = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.epoch += 1;
            state.active.take()
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        self.subscriptions.lock().await.close_all().await;
        self.listeners.clear();
        tracing::info!(user = %self.me.id, "messaging session disposed");
    }
}

/// Applies the result of an insert to the activation that issued it, if it
/// is still current.
fn settle_send(
    active: Option<&mut Activation>,
    profiles: &ProfileIndex,
    local_id: &LocalId,
    result: Result<InsertOutcome, StoreError>,
) -> Result<MessageKey, SyncError> {
    match result {
        Ok(InsertOutcome::Echoed(row)) => {
            let id = row.id;
            if let Some(active) = active {
                match active.normalizer.message_from_row(row, profiles) {
                    Ok(message) => match active.tracker.confirm(local_id, id) {
                        Confirmation::Replace | Confirmation::Unknown => {
                            active.store.replace(local_id, message);
                        }
                        Confirmation::AlreadyEchoed | Confirmation::EchoedAsOther(_) => {
                            active.store.append(message);
                        }
                    },
                    Err(rejection) => {
                        tracing::warn!(%local_id, %rejection, "stored row does not match the conversation");
                        active.tracker.accepted(local_id);
                    }
                }
            }
            Ok(MessageKey::Stored(id))
        }
        Ok(InsertOutcome::Accepted) => {
            if let Some(active) = active {
                active.tracker.accepted(local_id);
            }
            Ok(MessageKey::Local(local_id.clone()))
        }
        Err(source) => {
            if let Some(active) = active {
                let reason = source.to_string();
                match active.tracker.fail(local_id, &reason, source.is_transient()) {
                    FailOutcome::AlreadyEchoed(id) => return Ok(MessageKey::Stored(id)),
                    FailOutcome::EchoReleased(entry) => {
                        active.store.append(entry);
                    }
                    FailOutcome::MarkedFailed | FailOutcome::Unknown => {
                        active.store.mark_failed(local_id, &reason);
                    }
                }
            }
            tracing::warn!(%local_id, error = %source, "send failed");
            Err(SyncError::SendFailed {
                local_id: local_id.clone(),
                source,
            })
        }
    }
}

fn media_kind(file_name: &str) -> MessageKind {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => MessageKind::Image,
        _ => MessageKind::File,
    }
}

struct SessionSink(Weak<SessionInner>);

#[async_trait::async_trait]
impl FeedSink for SessionSink {
    async fn on_change(&self, scope: ScopeKey, epoch: u64, event: ChangeEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_change(scope, epoch, event).await;
        }
    }

    async fn on_resubscribed(&self, scope: ScopeKey, epoch: u64) {
        if let Some(inner) = self.0.upgrade() {
            tracing::info!(%scope, "resubscribed, reconciling");
            inner.catch_up(scope, epoch).await;
        }
    }

    async fn on_reconcile_due(&self, scope: ScopeKey, epoch: u64) {
        if let Some(inner) = self.0.upgrade() {
            inner.catch_up(scope, epoch).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingService for MessagingSession {
    async fn activate_conversation(&self, partner: UserId) -> Result<(), SyncError> {
        let scope = ScopeKey::direct(self.inner.me.id, partner);
        self.inner.activate(scope, Recipient::Direct(partner)).await
    }

    async fn activate_group(&self, group: GroupId) -> Result<(), SyncError> {
        self.inner
            .activate(ScopeKey::Group(group), Recipient::Group(group))
            .await
    }

    async fn deactivate(&self) {
        self.inner.deactivate().await
    }

    async fn send_message(&self, content: &str) -> Result<MessageKey, SyncError> {
        self.inner.send(content, MessageKind::Text, None).await
    }

    async fn send_media(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        caption: &str,
    ) -> Result<MessageKey, SyncError> {
        self.inner.send_media(bytes, file_name, caption).await
    }

    async fn retry_send(&self, local_id: &LocalId) -> Result<MessageKey, SyncError> {
        self.inner.retry_send(local_id).await
    }

    fn active_scope(&self) -> Option<ScopeKey> {
        self.inner.lock().active.as_ref().map(|a| a.scope)
    }

    fn ordered_messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|a| a.store.ordered())
            .unwrap_or_default()
    }

    fn delivery_state(&self, key: &MessageKey) -> Option<DeliveryState> {
        let state = self.inner.lock();
        let message = state.active.as_ref()?.store.get(key)?;
        Some(message.delivery_state())
    }

    fn on_store_changed(&self, listener: StoreListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    async fn thread_rendered(&self) -> Result<usize, SyncError> {
        self.inner.thread_rendered().await
    }

    async fn load_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        self.inner.load_conversations().await
    }

    fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().directory.summaries()
    }

    async fn reconcile(&self) -> Result<usize, SyncError> {
        self.inner.reconcile().await
    }

    async fn dispose(&self) {
        self.inner.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_follows_extension() {
        assert_eq!(media_kind("cat.JPG"), MessageKind::Image);
        assert_eq!(media_kind("notes.pdf"), MessageKind::File);
        assert_eq!(media_kind("README"), MessageKind::File);
    }

    fn activation(me: &Profile, partner: UserId) -> Activation {
        let scope = ScopeKey::direct(me.id, partner);
        Activation {
            epoch: 1,
            scope,
            recipient: Recipient::Direct(partner),
            cancel: CancellationToken::new(),
            normalizer: EventNormalizer::new(me.clone(), scope, None),
            store: MergeStore::new(),
            tracker: SendTracker::new(me.clone(), std::time::Duration::from_secs(30)),
            seen: SeenBatcher::default(),
        }
    }

    #[test]
    fn rejected_insert_keeps_a_matched_echo_separate() {
        let me = Profile::new(UserId::from_handle("me"), "me");
        let partner = UserId::from_handle("partner");
        let mut active = activation(&me, partner);
        let draft = Draft::text(Recipient::Direct(partner), "same words");
        let (local_id, message) = active.tracker.track(draft, Utc::now());
        active.store.append(message);

        // the same text sent from another tab arrives first
        let other = Message {
            key: MessageKey::Stored(MessageId(uuid::Uuid::new_v4())),
            status: SendStatus::Confirmed,
            created_at: Utc::now(),
            ..active.store.ordered()[0].clone()
        };
        let matched = active.tracker.match_echo(&other).unwrap();
        active.store.replace(&matched, other.clone());

        let result = settle_send(
            Some(&mut active),
            &ProfileIndex::default(),
            &local_id,
            Err(StoreError::PermissionDenied("rls".into())),
        );

        assert!(matches!(result, Err(SyncError::SendFailed { .. })));
        let ordered = active.store.ordered();
        assert_eq!(ordered.len(), 2);
        assert_eq!(
            active.store.get(&other.key).map(|m| &m.status),
            Some(&SendStatus::Confirmed)
        );
        assert!(matches!(
            active.store.get(&MessageKey::Local(local_id)).map(|m| &m.status),
            Some(SendStatus::Failed(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_delivered_ack_releases_its_claim() {
        let db = crate::infra_memory::MemoryDatabase::new();
        let me = db.add_user("me");
        let partner = db.add_user("partner");
        let session = MessagingSession::connect(db.ports_for(me.id), SyncConfig::default())
            .await
            .unwrap();
        let inner = session.inner.clone();

        let incoming = Message {
            key: MessageKey::Stored(MessageId(uuid::Uuid::new_v4())),
            sender: partner.id,
            recipient: Recipient::Direct(me.id),
            content: "hi".to_owned(),
            kind: MessageKind::Text,
            media_url: None,
            created_at: Utc::now(),
            delivered_at: None,
            seen_at: None,
            sender_profile: None,
            status: SendStatus::Confirmed,
        };
        let ids = inner.lock().delivered.take_unacked(me.id, [&incoming]);
        assert_eq!(ids.len(), 1);

        // keeps failing and sleeping between attempts until dropped
        db.fail_next_updates(10);
        let ack = inner.ack_delivered(ids, Utc::now());
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), ack)
                .await
                .is_err()
        );

        assert!(inner.lock().delivered.is_empty());
        let again = inner.lock().delivered.take_unacked(me.id, [&incoming]);
        assert_eq!(again.len(), 1);
        session.dispose().await;
    }

    #[test]
    fn failed_insert_marks_entry_failed() {
        let me = Profile::new(UserId::from_handle("me"), "me");
        let partner = UserId::from_handle("partner");
        let mut active = activation(&me, partner);
        let draft = Draft::text(Recipient::Direct(partner), "hi");
        let (local_id, message) = active.tracker.track(draft, Utc::now());
        active.store.append(message);

        let result = settle_send(
            Some(&mut active),
            &ProfileIndex::default(),
            &local_id,
            Err(StoreError::PermissionDenied("rls".into())),
        );

        assert!(matches!(result, Err(SyncError::SendFailed { .. })));
        let key = MessageKey::Local(local_id);
        assert!(matches!(
            active.store.get(&key).map(|m| &m.status),
            Some(SendStatus::Failed(_))
        ));
    }
}
