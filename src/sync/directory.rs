//! Distinct direct-conversation partners of the current user.

use crate::domain_model::*;

#[derive(Debug)]
pub struct ConversationDirectory {
    me: UserId,
    entries: Vec<ConversationSummary>,
    loaded: bool,
}

impl ConversationDirectory {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            entries: Vec::new(),
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, partner: UserId) -> bool {
        self.position(partner).is_some()
    }

    /// Merges recent direct messages, newest first. Partners are listed in
    /// the order their latest message appears; partners observed before the
    /// load keep their place. Returns true if the directory changed.
    pub fn load(&mut self, recent: Vec<MessageRow>) -> bool {
        self.loaded = true;
        let mut changed = false;
        for row in recent {
            match Message::try_from(row) {
                Ok(message) => changed |= self.observe(&message),
                Err(e) => tracing::debug!(error = %e, "skipping malformed row in directory load"),
            }
        }
        changed
    }

    /// Records a sent or received direct message. New partners are appended;
    /// existing ones get a newer preview. Returns true if anything changed.
    pub fn observe(&mut self, message: &Message) -> bool {
        let Some(partner) = message.direct_partner(self.me) else {
            return false;
        };
        let preview = MessagePreview::of(message, self.me);

        match self.position(partner) {
            Some(pos) => {
                let entry = &mut self.entries[pos];
                let newer = entry
                    .last_message
                    .as_ref()
                    .is_none_or(|last| last.created_at < preview.created_at);
                if newer {
                    entry.last_message = Some(preview);
                }
                newer
            }
            None => {
                tracing::debug!(%partner, "new conversation partner");
                self.entries.push(ConversationSummary {
                    partner_id: partner,
                    partner: None,
                    last_message: Some(preview),
                });
                true
            }
        }
    }

    /// Partners whose profile has not been attached yet.
    pub fn missing_profiles(&self) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|e| e.partner.is_none())
            .map(|e| e.partner_id)
            .collect()
    }

    pub fn attach_profiles(&mut self, profiles: &[Profile]) -> usize {
        let mut changed = 0;
        for profile in profiles {
            if let Some(pos) = self.position(profile.id) {
                let entry = &mut self.entries[pos];
                if entry.partner.as_ref() != Some(profile) {
                    entry.partner = Some(profile.clone());
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.entries.clone()
    }

    fn position(&self, partner: UserId) -> Option<usize> {
        self.entries.iter().position(|e| e.partner_id == partner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn me() -> UserId {
        UserId::from_handle("me")
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn row(sender: UserId, receiver: UserId, content: &str, at: i64) -> MessageRow {
        MessageRow {
            id: MessageId(uuid::Uuid::new_v4()),
            sender_id: sender,
            receiver_id: Some(receiver),
            group_id: None,
            content: content.to_owned(),
            message_type: MessageKind::Text,
            media_url: None,
            created_at: t(at),
            delivered_at: None,
            seen_at: None,
        }
    }

    #[test]
    fn load_lists_each_partner_once_by_recency() {
        let bob = UserId::from_handle("bob");
        let carol = UserId::from_handle("carol");
        let mut directory = ConversationDirectory::new(me());

        directory.load(vec![
            row(carol, me(), "latest", 30),
            row(me(), bob, "to bob", 20),
            row(carol, me(), "older", 10),
        ]);

        let summaries = directory.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].partner_id, carol);
        assert_eq!(summaries[0].last_message.as_ref().unwrap().content, "latest");
        assert_eq!(summaries[1].partner_id, bob);
        assert!(summaries[1].last_message.as_ref().unwrap().from_me);
    }

    #[test]
    fn observing_new_partner_appends_without_removing() {
        let bob = UserId::from_handle("bob");
        let dave = UserId::from_handle("dave");
        let mut directory = ConversationDirectory::new(me());
        directory.load(vec![row(bob, me(), "hi", 0)]);

        let message = Message::try_from(row(dave, me(), "new here", 5)).unwrap();
        assert!(directory.observe(&message));
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.summaries()[1].partner_id, dave);

        // an older message does not roll the preview back
        let stale = Message::try_from(row(dave, me(), "ancient", 1)).unwrap();
        assert!(!directory.observe(&stale));
        assert_eq!(
            directory.summaries()[1].last_message.as_ref().unwrap().content,
            "new here"
        );
    }

    #[test]
    fn group_messages_are_ignored() {
        let mut directory = ConversationDirectory::new(me());
        let mut r = row(UserId::from_handle("bob"), me(), "group", 0);
        r.receiver_id = None;
        r.group_id = Some(GroupId::new_random());

        assert!(!directory.load(vec![r]));
        assert!(directory.is_empty());
    }

    #[test]
    fn profiles_attach_to_known_partners() {
        let bob = Profile::new(UserId::from_handle("bob"), "bob");
        let mut directory = ConversationDirectory::new(me());
        directory.load(vec![row(bob.id, me(), "hi", 0)]);
        assert_eq!(directory.missing_profiles(), vec![bob.id]);

        let stranger = Profile::new(UserId::from_handle("stranger"), "stranger");
        assert_eq!(directory.attach_profiles(&[bob.clone(), stranger]), 1);
        assert!(directory.missing_profiles().is_empty());
        assert_eq!(directory.summaries()[0].partner, Some(bob));
    }
}
