//! Boundary between the untyped change feed and the typed store.
//!
//! Every raw event either becomes a canonical [`Message`] that belongs to the
//! normalizer's scope, or a [`Rejection`]. Nothing untyped gets past here.

use crate::domain_model::*;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Profiles the client already holds, keyed by identity.
#[derive(Debug, Default)]
pub struct ProfileIndex {
    profiles: HashMap<UserId, Profile>,
    requested: HashSet<UserId>,
}

impl ProfileIndex {
    pub fn get(&self, id: UserId) -> Option<&Profile> {
        self.profiles.get(&id)
    }

    pub fn insert(&mut self, profile: Profile) {
        self.requested.remove(&profile.id);
        self.profiles.insert(profile.id, profile);
    }

    pub fn extend(&mut self, profiles: impl IntoIterator<Item = Profile>) {
        for profile in profiles {
            self.insert(profile);
        }
    }

    /// Ids that are neither cached nor already being fetched. The returned ids
    /// are marked as requested.
    pub fn claim_missing(&mut self, ids: impl IntoIterator<Item = UserId>) -> Vec<UserId> {
        let mut missing = Vec::new();
        for id in ids {
            if !self.profiles.contains_key(&id) && self.requested.insert(id) {
                missing.push(id);
            }
        }
        missing
    }

    /// Forget a failed fetch so a later event can claim it again.
    pub fn release(&mut self, ids: &[UserId]) {
        for id in ids {
            self.requested.remove(id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("event for table {0}")]
    WrongTable(String),
    #[error("unsupported change kind {0}")]
    UnsupportedKind(ChangeKind),
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error("event outside the active scope")]
    ForeignScope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Insert(Message),
    Update(Message),
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
pub struct EventNormalizer {
    me: Profile,
    scope: ScopeKey,
    partner: Option<Profile>,
}

impl EventNormalizer {
    pub fn new(me: Profile, scope: ScopeKey, partner: Option<Profile>) -> Self {
        Self { me, scope, partner }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn set_partner(&mut self, partner: Profile) {
        self.partner = Some(partner);
    }

    pub fn normalize(&self, event: &ChangeEvent, index: &ProfileIndex) -> Normalized {
        if event.table != MESSAGES_TABLE {
            return Normalized::Rejected(Rejection::WrongTable(event.table.clone()));
        }
        if event.kind == ChangeKind::Delete {
            return Normalized::Rejected(Rejection::UnsupportedKind(event.kind));
        }

        let row = match MessageRow::deserialize(&event.row) {
            Ok(row) => row,
            Err(e) => return Normalized::Rejected(Rejection::Malformed(e.to_string())),
        };

        match self.message_from_row(row, index) {
            Ok(message) if event.kind == ChangeKind::Insert => Normalized::Insert(message),
            Ok(message) => Normalized::Update(message),
            Err(rejection) => Normalized::Rejected(rejection),
        }
    }

    /// Converts a stored row (from history or from an insert echo) and
    /// attaches the sender profile.
    pub fn message_from_row(
        &self,
        row: MessageRow,
        index: &ProfileIndex,
    ) -> Result<Message, Rejection> {
        let mut message =
            Message::try_from(row).map_err(|e| Rejection::Malformed(e.to_string()))?;
        if !self.scope.admits(message.sender, message.recipient) {
            return Err(Rejection::ForeignScope);
        }
        message.sender_profile = self.profile_for(message.sender, index);
        Ok(message)
    }

    fn profile_for(&self, sender: UserId, index: &ProfileIndex) -> Option<Profile> {
        if sender == self.me.id {
            return Some(self.me.clone());
        }
        match &self.partner {
            Some(partner) if partner.id == sender => Some(partner.clone()),
            _ => index.get(sender).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn alice() -> Profile {
        Profile::new(UserId::from_handle("alice"), "alice")
    }

    fn bob() -> Profile {
        Profile::new(UserId::from_handle("bob"), "bob")
    }

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(alice(), ScopeKey::direct(alice().id, bob().id), Some(bob()))
    }

    fn insert(sender: UserId, receiver: UserId) -> ChangeEvent {
        ChangeEvent::new(
            ChangeKind::Insert,
            MESSAGES_TABLE,
            json!({
                "id": uuid::Uuid::new_v4(),
                "sender_id": sender,
                "receiver_id": receiver,
                "content": "hey",
                "created_at": Utc::now(),
            }),
        )
    }

    #[test]
    fn partner_insert_gets_partner_profile() {
        let index = ProfileIndex::default();
        match normalizer().normalize(&insert(bob().id, alice().id), &index) {
            Normalized::Insert(m) => {
                assert_eq!(m.sender, bob().id);
                assert_eq!(m.sender_profile, Some(bob()));
                assert_eq!(m.status, SendStatus::Confirmed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_from_another_conversation_is_rejected() {
        let carol = UserId::from_handle("carol");
        let index = ProfileIndex::default();
        assert_eq!(
            normalizer().normalize(&insert(carol, alice().id), &index),
            Normalized::Rejected(Rejection::ForeignScope)
        );
    }

    #[test]
    fn missing_fields_are_malformed() {
        let event = ChangeEvent::new(
            ChangeKind::Insert,
            MESSAGES_TABLE,
            json!({ "id": uuid::Uuid::new_v4(), "content": "no sender" }),
        );
        let index = ProfileIndex::default();
        assert!(matches!(
            normalizer().normalize(&event, &index),
            Normalized::Rejected(Rejection::Malformed(_))
        ));
    }

    #[test]
    fn deletes_and_other_tables_are_rejected() {
        let index = ProfileIndex::default();
        let mut event = insert(bob().id, alice().id);
        event.kind = ChangeKind::Delete;
        assert_eq!(
            normalizer().normalize(&event, &index),
            Normalized::Rejected(Rejection::UnsupportedKind(ChangeKind::Delete))
        );

        let mut event = insert(bob().id, alice().id);
        event.table = "profiles".to_owned();
        assert!(matches!(
            normalizer().normalize(&event, &index),
            Normalized::Rejected(Rejection::WrongTable(_))
        ));
    }

    #[test]
    fn group_sender_profile_comes_from_index() {
        let group = GroupId::new_random();
        let carol = Profile::new(UserId::from_handle("carol"), "carol");
        let mut index = ProfileIndex::default();
        index.insert(carol.clone());
        let n = EventNormalizer::new(alice(), ScopeKey::Group(group), None);
        let event = ChangeEvent::new(
            ChangeKind::Update,
            MESSAGES_TABLE,
            json!({
                "id": uuid::Uuid::new_v4(),
                "sender_id": carol.id,
                "group_id": group,
                "content": "hello all",
                "created_at": Utc::now(),
            }),
        );

        match n.normalize(&event, &index) {
            Normalized::Update(m) => assert_eq!(m.sender_profile, Some(carol)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn claim_missing_hands_out_each_id_once() {
        let mut index = ProfileIndex::default();
        let carol = UserId::from_handle("carol");
        assert_eq!(index.claim_missing([carol, carol]), vec![carol]);
        assert!(index.claim_missing([carol]).is_empty());
        index.release(&[carol]);
        assert_eq!(index.claim_missing([carol]), vec![carol]);
    }
}
