//! Acknowledgment bookkeeping: `sent -> delivered -> seen`.
//!
//! Messages only move forward and only on the recipient side. Delivered acks
//! are sent at most once per id per session; seen acks go out as a single
//! conditional write per rendered thread.

use crate::domain_model::*;
use crate::domain_port::{MessagePatch, UpdateFilter};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// One batched mark-seen write for a direct conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenBatch {
    pub me: UserId,
    pub partner: UserId,
    pub at: DateTime<Utc>,
}

impl SeenBatch {
    pub fn filter(&self) -> UpdateFilter {
        UpdateFilter::unseen_from(self.partner, self.me)
    }

    pub fn patch(&self) -> MessagePatch {
        MessagePatch::seen(self.at)
    }
}

#[derive(Debug, Default)]
pub struct SeenBatcher {
    in_flight: bool,
    rerun: bool,
}

impl SeenBatcher {
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Starts a batch when some incoming message from `partner` is still
    /// unseen. Returns `None` when nothing qualifies or a batch is running;
    /// in the latter case the caller is asked to run again on `finish`.
    pub fn begin<'a>(
        &mut self,
        me: UserId,
        partner: UserId,
        messages: impl IntoIterator<Item = &'a Message>,
        at: DateTime<Utc>,
    ) -> Option<SeenBatch> {
        let pending = messages.into_iter().any(|m| {
            !m.key.is_local() && m.sender == partner && m.is_incoming_for(me) && m.seen_at.is_none()
        });
        if !pending {
            return None;
        }
        if self.in_flight {
            self.rerun = true;
            return None;
        }
        self.in_flight = true;
        Some(SeenBatch { me, partner, at })
    }

    /// Ends the running batch. Returns true if another render asked for a
    /// batch in the meantime.
    pub fn finish(&mut self) -> bool {
        self.in_flight = false;
        std::mem::take(&mut self.rerun)
    }
}

/// Ids this session has already acknowledged as delivered.
#[derive(Debug, Default)]
pub struct DeliveredAcks {
    acked: HashSet<MessageId>,
}

impl DeliveredAcks {
    /// Incoming messages for `me` that still lack a delivered timestamp and
    /// were not acknowledged before. The returned ids are recorded.
    pub fn take_unacked<'a>(
        &mut self,
        me: UserId,
        messages: impl IntoIterator<Item = &'a Message>,
    ) -> Vec<MessageId> {
        let mut ids = Vec::new();
        for message in messages {
            if !message.is_incoming_for(me) || message.delivered_at.is_some() {
                continue;
            }
            if let Some(id) = message.stored_id() {
                if self.acked.insert(id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Forget ids whose write failed so a later pass acknowledges them again.
    pub fn release(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.acked.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.acked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn me() -> UserId {
        UserId::from_handle("me")
    }

    fn partner() -> UserId {
        UserId::from_handle("partner")
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn message(n: u128, sender: UserId, receiver: UserId) -> Message {
        Message {
            key: MessageKey::Stored(MessageId(uuid::Uuid::from_u128(n))),
            sender,
            recipient: Recipient::Direct(receiver),
            content: "x".to_owned(),
            kind: MessageKind::Text,
            media_url: None,
            created_at: at(),
            delivered_at: None,
            seen_at: None,
            sender_profile: None,
            status: SendStatus::Confirmed,
        }
    }

    #[test]
    fn nothing_unseen_means_no_batch() {
        let mut batcher = SeenBatcher::default();
        let mine = message(1, me(), partner());
        let mut seen = message(2, partner(), me());
        seen.seen_at = Some(at());

        assert_eq!(batcher.begin(me(), partner(), [&mine, &seen], at()), None);
        assert!(!batcher.in_flight());
    }

    #[test]
    fn batches_never_overlap() {
        let mut batcher = SeenBatcher::default();
        let unseen = message(1, partner(), me());

        let batch = batcher.begin(me(), partner(), [&unseen], at()).unwrap();
        assert_eq!(batch.filter(), UpdateFilter::unseen_from(partner(), me()));
        assert_eq!(batch.patch().seen_at, Some(at()));
        assert_eq!(batch.patch().delivered_at, Some(at()));

        assert_eq!(batcher.begin(me(), partner(), [&unseen], at()), None);
        assert!(batcher.finish());
        assert!(!batcher.finish());
        assert!(batcher.begin(me(), partner(), [&unseen], at()).is_some());
    }

    #[test]
    fn delivered_acks_are_taken_once() {
        let mut acks = DeliveredAcks::default();
        let a = message(1, partner(), me());
        let b = message(2, partner(), me());
        let mine = message(3, me(), partner());
        let mut already = message(4, partner(), me());
        already.delivered_at = Some(at());

        let ids = acks.take_unacked(me(), [&a, &b, &mine, &already]);
        assert_eq!(ids, vec![a.stored_id().unwrap(), b.stored_id().unwrap()]);
        assert!(acks.take_unacked(me(), [&a, &b]).is_empty());

        acks.release(&ids[..1]);
        assert_eq!(acks.take_unacked(me(), [&a, &b]), vec![a.stored_id().unwrap()]);
    }
}
