use crate::domain_model::*;
use serde::Serialize;
use std::fmt;

/// Bounds which events a subscription receives and which messages a store holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
#[serde(tag = "type", content = "key", rename_all = "lowercase")]
pub enum ScopeKey {
    Direct(UserPair),
    Group(GroupId),
    /// Every direct message addressed to one user, whatever the sender.
    Inbox(UserId),
}

impl ScopeKey {
    pub fn direct(me: UserId, partner: UserId) -> Self {
        ScopeKey::Direct(UserPair::new(me, partner))
    }

    /// Whether a message with this sender and recipient belongs to the scope.
    pub fn admits(&self, sender: UserId, recipient: Recipient) -> bool {
        match (self, recipient) {
            (ScopeKey::Direct(pair), Recipient::Direct(receiver)) => {
                sender != receiver && pair.contains(sender) && pair.contains(receiver)
            }
            (ScopeKey::Group(group), Recipient::Group(target)) => *group == target,
            (ScopeKey::Inbox(me), Recipient::Direct(receiver)) => *me == receiver && sender != *me,
            _ => false,
        }
    }

    pub fn channel_name(&self) -> String {
        match self {
            ScopeKey::Direct(pair) => format!("messages-{}-{}", pair.first(), pair.second()),
            ScopeKey::Group(group) => format!("group-{group}"),
            ScopeKey::Inbox(user) => format!("inbox-{user}"),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}
