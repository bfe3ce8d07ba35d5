//! Ordered, key-deduplicated message sequence for one conversation.
//!
//! Entries are kept sorted by `(created_at, arrival)`, where `arrival` is a
//! counter assigned when an entry first enters the store. Every mutation keyed
//! by a permanent id is idempotent, so history loads and live events may land
//! in any interleaving and still converge to the same sequence.

use crate::domain_model::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
}

impl Entry {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.arrival)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Already present; acknowledgment fields were filled in.
    Merged,
    Duplicate,
}

impl AppendOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, AppendOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    /// The confirmed entry was already present; the temporary one was dropped.
    Deduplicated,
    /// No temporary entry matched; the confirmed entry was appended instead.
    Appended(AppendOutcome),
}

#[derive(Debug, Default)]
pub struct MergeStore {
    entries: Vec<Entry>,
    stored: HashSet<MessageId>,
    next_arrival: u64,
    loaded: bool,
}

impl MergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn append(&mut self, message: Message) -> AppendOutcome {
        match message.stored_id() {
            Some(id) if self.stored.contains(&id) => {
                let Some(pos) = self.position(&message.key) else {
                    tracing::error!(%id, "stored id indexed but missing from sequence");
                    return AppendOutcome::Duplicate;
                };
                let existing = &mut self.entries[pos].message;
                if existing.content != message.content || existing.sender != message.sender {
                    tracing::warn!(%id, "duplicate message id with divergent content, keeping first copy");
                }
                if existing.merge_acks(&message) {
                    check_transition(existing);
                    AppendOutcome::Merged
                } else {
                    AppendOutcome::Duplicate
                }
            }
            Some(id) => {
                self.stored.insert(id);
                self.insert_new(message);
                AppendOutcome::Inserted
            }
            None if self.position(&message.key).is_some() => AppendOutcome::Duplicate,
            None => {
                self.insert_new(message);
                AppendOutcome::Inserted
            }
        }
    }

    /// Applies an update event. Only acknowledgment fields can change; an
    /// update for a message the store has not seen yet is appended.
    pub fn apply_update(&mut self, message: Message) -> AppendOutcome {
        if message.key.is_local() {
            tracing::warn!(key = %message.key, "update event for a temporary entry ignored");
            return AppendOutcome::Duplicate;
        }
        self.append(message)
    }

    /// Swaps the temporary entry `local` for its confirmed counterpart.
    pub fn replace(&mut self, local: &LocalId, message: Message) -> ReplaceOutcome {
        let Some(pos) = self.position(&MessageKey::Local(local.clone())) else {
            return ReplaceOutcome::Appended(self.append(message));
        };

        let temp = self.entries.remove(pos);
        let Some(id) = message.stored_id() else {
            tracing::warn!(%local, "replacement carries no permanent id, keeping temporary entry");
            self.insert_sorted(temp);
            return ReplaceOutcome::Deduplicated;
        };

        if self.stored.contains(&id) {
            self.append(message);
            return ReplaceOutcome::Deduplicated;
        }

        self.stored.insert(id);
        self.insert_sorted(Entry {
            message,
            arrival: temp.arrival,
        });
        ReplaceOutcome::Replaced
    }

    /// Merges the historical sequence of the conversation. Live entries that
    /// arrived earlier are kept; returns how many entries changed.
    pub fn load(&mut self, history: Vec<Message>) -> usize {
        if self.loaded {
            tracing::debug!("history merged again into a loaded store");
        }
        self.loaded = true;
        let mut changed = 0;
        for message in history {
            if self.append(message).changed() {
                changed += 1;
            }
        }
        changed
    }

    pub fn mark_failed(&mut self, local: &LocalId, reason: &str) -> bool {
        self.set_status(local, SendStatus::Failed(reason.to_owned()))
    }

    pub fn mark_pending(&mut self, local: &LocalId) -> bool {
        self.set_status(local, SendStatus::Pending)
    }

    pub fn mark_delivered(&mut self, ids: &[MessageId], at: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            let message = &mut entry.message;
            let hit = message.stored_id().is_some_and(|id| ids.contains(&id));
            if hit && message.delivered_at.is_none() {
                message.delivered_at = Some(at);
                changed += 1;
            }
        }
        changed
    }

    /// Fills seen_at (and delivered_at if still null) on stored messages from
    /// `partner` to `me`.
    pub fn mark_seen_incoming(&mut self, me: UserId, partner: UserId, at: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            let message = &mut entry.message;
            if message.key.is_local()
                || message.sender != partner
                || !message.is_incoming_for(me)
                || message.seen_at.is_some()
            {
                continue;
            }
            message.delivered_at.get_or_insert(at);
            message.seen_at = Some(at);
            changed += 1;
        }
        changed
    }

    pub fn attach_profile(&mut self, profile: &Profile) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if entry.message.sender == profile.id && entry.message.sender_profile.is_none() {
                entry.message.sender_profile = Some(profile.clone());
                changed += 1;
            }
        }
        changed
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.position(key).map(|pos| &self.entries[pos].message)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn ordered(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    fn set_status(&mut self, local: &LocalId, status: SendStatus) -> bool {
        let key = MessageKey::Local(local.clone());
        match self.position(&key) {
            Some(pos) => {
                self.entries[pos].message.status = status;
                true
            }
            None => false,
        }
    }

    fn position(&self, key: &MessageKey) -> Option<usize> {
        self.entries.iter().position(|e| e.message.key == *key)
    }

    fn insert_new(&mut self, message: Message) {
        check_transition(&message);
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.insert_sorted(Entry { message, arrival });
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = entry.sort_key();
        let pos = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(pos, entry);
    }
}

fn check_transition(message: &Message) {
    if message.seen_at.is_some() && message.delivered_at.is_none() {
        tracing::warn!(key = %message.key, "message seen before it was delivered");
    }
}
