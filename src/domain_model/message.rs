use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Permanent id assigned by storage.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(MessageId)
    }
}

/// Temporary id generated by the client for an optimistic entry.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!("local-{}", nanoid::nanoid!(12)))
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum MessageKey {
    Local(LocalId),
    Stored(MessageId),
}

impl MessageKey {
    pub fn stored_id(&self) -> Option<MessageId> {
        match self {
            MessageKey::Stored(id) => Some(*id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageKey::Local(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Local(id) => write!(f, "{id}"),
            MessageKey::Stored(id) => write!(f, "{id}"),
        }
    }
}

impl From<MessageId> for MessageKey {
    fn from(id: MessageId) -> Self {
        MessageKey::Stored(id)
    }
}

impl From<LocalId> for MessageKey {
    fn from(id: LocalId) -> Self {
        MessageKey::Local(id)
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Recipient {
    Direct(UserId),
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

/// Local presentation flag for an entry, independent of delivery state.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Failed(String),
    Confirmed,
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Seen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub key: MessageKey,
    pub sender: UserId,
    pub recipient: Recipient,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
    pub sender_profile: Option<Profile>,
    pub status: SendStatus,
}

impl Message {
    pub fn stored_id(&self) -> Option<MessageId> {
        self.key.stored_id()
    }

    pub fn delivery_state(&self) -> DeliveryState {
        if self.seen_at.is_some() {
            DeliveryState::Seen
        } else if self.delivered_at.is_some() {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    }

    /// Direct message addressed to `me` by someone else.
    pub fn is_incoming_for(&self, me: UserId) -> bool {
        self.sender != me && self.recipient == Recipient::Direct(me)
    }

    /// The other identity of a direct message, seen from `me`.
    pub fn direct_partner(&self, me: UserId) -> Option<UserId> {
        match self.recipient {
            Recipient::Direct(receiver) if self.sender == me => Some(receiver),
            Recipient::Direct(receiver) if receiver == me => Some(self.sender),
            _ => None,
        }
    }

    /// Fills null acknowledgment timestamps from `other`; both fields are write-once.
    /// Returns true if anything changed.
    pub fn merge_acks(&mut self, other: &Message) -> bool {
        let mut changed = false;
        if self.delivered_at.is_none() && other.delivered_at.is_some() {
            self.delivered_at = other.delivered_at;
            changed = true;
        }
        if self.seen_at.is_none() && other.seen_at.is_some() {
            self.seen_at = other.seen_at;
            changed = true;
        }
        if self.sender_profile.is_none() && other.sender_profile.is_some() {
            self.sender_profile = other.sender_profile.clone();
            changed = true;
        }
        changed
    }
}

/// A message row as the storage backend and the change feed carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
}

/// Row written by the client; id and created_at are assigned by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageRow {
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub message_type: MessageKind,
    pub media_url: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidRow {
    #[error("row has both receiver and group")]
    AmbiguousRecipient,
    #[error("row has neither receiver nor group")]
    MissingRecipient,
}

impl MessageRow {
    pub fn recipient(&self) -> Result<Recipient, InvalidRow> {
        match (self.receiver_id, self.group_id) {
            (Some(receiver), None) => Ok(Recipient::Direct(receiver)),
            (None, Some(group)) => Ok(Recipient::Group(group)),
            (Some(_), Some(_)) => Err(InvalidRow::AmbiguousRecipient),
            (None, None) => Err(InvalidRow::MissingRecipient),
        }
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = InvalidRow;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let recipient = row.recipient()?;
        Ok(Message {
            key: MessageKey::Stored(row.id),
            sender: row.sender_id,
            recipient,
            content: row.content,
            kind: row.message_type,
            media_url: row.media_url,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            seen_at: row.seen_at,
            sender_profile: None,
            status: SendStatus::Confirmed,
        })
    }
}

impl NewMessageRow {
    pub fn for_recipient(
        sender: UserId,
        recipient: Recipient,
        content: &str,
        kind: MessageKind,
        media_url: Option<String>,
    ) -> Self {
        let (receiver_id, group_id) = match recipient {
            Recipient::Direct(user) => (Some(user), None),
            Recipient::Group(group) => (None, Some(group)),
        };
        Self {
            sender_id: sender,
            receiver_id,
            group_id,
            content: content.to_owned(),
            message_type: kind,
            media_url,
        }
    }
}
