//! Pending local sends and their reconciliation with confirmed rows.
//!
//! Sends are appended to the store right away under a [`LocalId`]. The
//! confirmed row then reaches the client in one of two ways, in any order:
//! the insert call returns it, or the change feed echoes it. The tracker
//! decides which temporary entry a confirmed row stands for so that exactly
//! one copy stays visible.

use crate::domain_model::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub recipient: Recipient,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
}

impl Draft {
    pub fn text(recipient: Recipient, content: &str) -> Self {
        Self {
            recipient,
            content: content.to_owned(),
            kind: MessageKind::Text,
            media_url: None,
        }
    }

    pub fn to_row(&self, sender: UserId) -> NewMessageRow {
        NewMessageRow::for_recipient(
            sender,
            self.recipient,
            &self.content,
            self.kind,
            self.media_url.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingState {
    /// The insert call has not returned yet.
    InFlight,
    /// Stored without an echoed row; waiting for the change feed.
    AwaitingEcho,
    Failed(String),
}

#[derive(Debug, Clone)]
struct PendingSend {
    local_id: LocalId,
    draft: Draft,
    created_at: DateTime<Utc>,
    state: PendingState,
    echoed: Option<MessageId>,
}

/// How a returned insert relates to what the change feed already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Nothing echoed yet; replace the temporary entry with this row.
    Replace,
    /// The echo already replaced the temporary entry with this same row.
    AlreadyEchoed,
    /// An echo was matched to this send by content but carried another id;
    /// this row is a distinct message and should be appended.
    EchoedAsOther(MessageId),
    /// The send is not tracked (stale activation or already settled).
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    MarkedFailed,
    /// The outcome of the write is unknown and an echo was matched to it;
    /// the echo is authoritative.
    AlreadyEchoed(MessageId),
    /// The write was rejected, so the echo matched earlier by content was
    /// another send. That row keeps its own entry and the send comes back
    /// as this failed temporary entry.
    EchoReleased(Message),
    Unknown,
}

#[derive(Debug)]
pub struct SendTracker {
    me: Profile,
    echo_window: chrono::Duration,
    pending: Vec<PendingSend>,
    confirmed: HashSet<MessageId>,
}

impl SendTracker {
    pub fn new(me: Profile, echo_window: Duration) -> Self {
        let echo_window =
            chrono::Duration::from_std(echo_window).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            me,
            echo_window,
            pending: Vec::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers a send and builds its optimistic entry.
    pub fn track(&mut self, draft: Draft, created_at: DateTime<Utc>) -> (LocalId, Message) {
        let local_id = LocalId::generate();
        let message = self.optimistic(&local_id, &draft, created_at, SendStatus::Pending);
        self.pending.push(PendingSend {
            local_id: local_id.clone(),
            draft,
            created_at,
            state: PendingState::InFlight,
            echoed: None,
        });
        (local_id, message)
    }

    /// Finds the temporary entry a confirmed row from the change feed stands
    /// for: same sender, recipient and content, created within the echo
    /// window, oldest first.
    pub fn match_echo(&mut self, echo: &Message) -> Option<LocalId> {
        let id = echo.stored_id()?;
        if echo.sender != self.me.id || self.confirmed.contains(&id) {
            return None;
        }
        if self.pending.iter().any(|p| p.echoed == Some(id)) {
            return None;
        }

        let pos = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.echoed.is_none()
                    && p.draft.recipient == echo.recipient
                    && p.draft.content == echo.content
                    && p.draft.kind == echo.kind
                    && p.draft.media_url == echo.media_url
                    && (p.created_at - echo.created_at).abs() <= self.echo_window
            })
            .min_by_key(|(_, p)| p.created_at)
            .map(|(pos, _)| pos)?;

        let local_id = self.pending[pos].local_id.clone();
        if self.pending[pos].state == PendingState::AwaitingEcho {
            self.pending.remove(pos);
            self.confirmed.insert(id);
        } else {
            self.pending[pos].echoed = Some(id);
        }
        Some(local_id)
    }

    /// The insert call returned the stored row.
    pub fn confirm(&mut self, local_id: &LocalId, id: MessageId) -> Confirmation {
        self.confirmed.insert(id);
        let Some(pos) = self.index_of(local_id) else {
            return Confirmation::Unknown;
        };
        let entry = self.pending.remove(pos);
        match entry.echoed {
            None => Confirmation::Replace,
            Some(echoed) if echoed == id => Confirmation::AlreadyEchoed,
            Some(echoed) => Confirmation::EchoedAsOther(echoed),
        }
    }

    /// The insert call succeeded without returning the row.
    pub fn accepted(&mut self, local_id: &LocalId) {
        if let Some(pos) = self.index_of(local_id) {
            match self.pending[pos].echoed {
                Some(id) => {
                    self.pending.remove(pos);
                    self.confirmed.insert(id);
                }
                None => self.pending[pos].state = PendingState::AwaitingEcho,
            }
        }
    }

    /// The insert call failed. A `transient` failure may still have stored
    /// the row, so an echo matched before it settles the send; a rejection
    /// never did, so such an echo is released.
    pub fn fail(&mut self, local_id: &LocalId, reason: &str, transient: bool) -> FailOutcome {
        let Some(pos) = self.index_of(local_id) else {
            return FailOutcome::Unknown;
        };
        match self.pending[pos].echoed {
            Some(id) if transient => {
                self.pending.remove(pos);
                self.confirmed.insert(id);
                FailOutcome::AlreadyEchoed(id)
            }
            Some(id) => {
                self.confirmed.insert(id);
                let entry = &mut self.pending[pos];
                entry.echoed = None;
                entry.state = PendingState::Failed(reason.to_owned());
                let entry = entry.clone();
                FailOutcome::EchoReleased(self.optimistic(
                    &entry.local_id,
                    &entry.draft,
                    entry.created_at,
                    SendStatus::Failed(reason.to_owned()),
                ))
            }
            None => {
                self.pending[pos].state = PendingState::Failed(reason.to_owned());
                FailOutcome::MarkedFailed
            }
        }
    }

    /// Puts a failed send back in flight and returns what to write again.
    pub fn retry(&mut self, local_id: &LocalId) -> Option<Draft> {
        let pos = self.index_of(local_id)?;
        let entry = &mut self.pending[pos];
        if !matches!(entry.state, PendingState::Failed(_)) || entry.echoed.is_some() {
            return None;
        }
        entry.state = PendingState::InFlight;
        Some(entry.draft.clone())
    }

    pub fn failure_reason(&self, local_id: &LocalId) -> Option<&str> {
        let pos = self.index_of(local_id)?;
        match &self.pending[pos].state {
            PendingState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    fn optimistic(
        &self,
        local_id: &LocalId,
        draft: &Draft,
        created_at: DateTime<Utc>,
        status: SendStatus,
    ) -> Message {
        Message {
            key: MessageKey::Local(local_id.clone()),
            sender: self.me.id,
            recipient: draft.recipient,
            content: draft.content.clone(),
            kind: draft.kind,
            media_url: draft.media_url.clone(),
            created_at,
            delivered_at: None,
            seen_at: None,
            sender_profile: Some(self.me.clone()),
            status,
        }
    }

    fn index_of(&self, local_id: &LocalId) -> Option<usize> {
        self.pending.iter().position(|p| p.local_id == *local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn me() -> Profile {
        Profile::new(UserId::from_handle("me"), "me")
    }

    fn partner() -> UserId {
        UserId::from_handle("partner")
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn tracker() -> SendTracker {
        SendTracker::new(me(), Duration::from_secs(10))
    }

    fn echo(n: u128, content: &str, at: i64) -> Message {
        Message {
            key: MessageKey::Stored(MessageId(uuid::Uuid::from_u128(n))),
            sender: me().id,
            recipient: Recipient::Direct(partner()),
            content: content.to_owned(),
            kind: MessageKind::Text,
            media_url: None,
            created_at: t(at),
            delivered_at: None,
            seen_at: None,
            sender_profile: None,
            status: SendStatus::Confirmed,
        }
    }

    #[test]
    fn tracked_message_is_pending_without_acks() {
        let mut tracker = tracker();
        let (local, m) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));

        assert_eq!(m.key, MessageKey::Local(local));
        assert_eq!(m.status, SendStatus::Pending);
        assert_eq!(m.delivered_at, None);
        assert_eq!(m.seen_at, None);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn echo_matches_by_content_within_window() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));

        assert_eq!(tracker.match_echo(&echo(1, "other", 1)), None);
        assert_eq!(tracker.match_echo(&echo(1, "hello", 60)), None);
        assert_eq!(tracker.match_echo(&echo(1, "hello", 2)), Some(local));
        // the same echo delivered twice only matches once
        assert_eq!(tracker.match_echo(&echo(1, "hello", 2)), None);
    }

    #[test]
    fn identical_sends_match_oldest_first() {
        let mut tracker = tracker();
        let (first, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "ok"), t(0));
        let (second, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "ok"), t(1));

        assert_eq!(tracker.match_echo(&echo(1, "ok", 1)), Some(first));
        assert_eq!(tracker.match_echo(&echo(2, "ok", 2)), Some(second));
    }

    #[test]
    fn confirm_after_echo_reports_already_echoed() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));
        let e = echo(1, "hello", 1);

        tracker.match_echo(&e);
        assert_eq!(tracker.confirm(&local, e.stored_id().unwrap()), Confirmation::AlreadyEchoed);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn confirmed_ids_never_match_other_pending_sends() {
        let mut tracker = tracker();
        let (first, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "ok"), t(0));
        tracker.track(Draft::text(Recipient::Direct(partner()), "ok"), t(1));
        let e = echo(1, "ok", 1);

        assert_eq!(tracker.confirm(&first, e.stored_id().unwrap()), Confirmation::Replace);
        assert_eq!(tracker.match_echo(&e), None);
    }

    #[test]
    fn accepted_send_settles_on_echo() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));
        tracker.accepted(&local);
        assert_eq!(tracker.pending_count(), 1);

        assert_eq!(tracker.match_echo(&echo(1, "hello", 0)), Some(local));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn failed_send_can_be_retried_once() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));

        assert_eq!(tracker.fail(&local, "denied", false), FailOutcome::MarkedFailed);
        assert_eq!(tracker.failure_reason(&local), Some("denied"));
        assert!(tracker.retry(&local).is_some());
        assert!(tracker.retry(&local).is_none());
    }

    #[test]
    fn failure_after_echo_defers_to_echo() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));
        let e = echo(5, "hello", 0);
        tracker.match_echo(&e);

        assert_eq!(
            tracker.fail(&local, "timeout", true),
            FailOutcome::AlreadyEchoed(e.stored_id().unwrap())
        );
    }

    #[test]
    fn rejection_after_echo_releases_it() {
        let mut tracker = tracker();
        let (local, _) = tracker.track(Draft::text(Recipient::Direct(partner()), "hello"), t(0));
        // another tab's identical message
        let other = echo(5, "hello", 0);
        assert_eq!(tracker.match_echo(&other), Some(local.clone()));

        let FailOutcome::EchoReleased(entry) = tracker.fail(&local, "denied", false) else {
            panic!("rejection must not settle on the echo");
        };
        assert_eq!(entry.key, MessageKey::Local(local.clone()));
        assert_eq!(entry.content, "hello");
        assert_eq!(entry.status, SendStatus::Failed("denied".to_owned()));
        assert_eq!(tracker.failure_reason(&local), Some("denied"));

        // the released row never matches again, and the send can be retried
        assert_eq!(tracker.match_echo(&other), None);
        assert!(tracker.retry(&local).is_some());
        let stored = echo(6, "hello", 1);
        tracker.accepted(&local);
        assert_eq!(tracker.match_echo(&stored), Some(local));
    }

    #[test]
    fn media_sends_match_by_url() {
        let mut tracker = tracker();
        let media = |url: &str| Draft {
            recipient: Recipient::Direct(partner()),
            content: "look".to_owned(),
            kind: MessageKind::Image,
            media_url: Some(url.to_owned()),
        };
        let (first, _) = tracker.track(media("memory://messages/a.png"), t(0));
        let (second, _) = tracker.track(media("memory://messages/b.png"), t(0));

        let mut e = echo(1, "look", 0);
        e.kind = MessageKind::Image;
        e.media_url = Some("memory://messages/b.png".to_owned());
        assert_eq!(tracker.match_echo(&e), Some(second));

        e.key = MessageKey::Stored(MessageId(uuid::Uuid::from_u128(2)));
        e.media_url = Some("memory://messages/a.png".to_owned());
        assert_eq!(tracker.match_echo(&e), Some(first));

        // a text echo with the same caption belongs to neither
        let mut text_only = SendTracker::new(me(), Duration::from_secs(10));
        text_only.track(media("memory://messages/a.png"), t(0));
        assert_eq!(text_only.match_echo(&echo(3, "look", 0)), None);
    }
}
