use crate::domain_model::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid row: {0}")]
    Invalid(String),
    #[error("request timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Store(String),
}

impl StoreError {
    /// Errors worth retrying without user involvement.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageFilter {
    /// Both directions of a direct conversation.
    Between(UserPair),
    Group(GroupId),
    /// Every direct message the user sent or received.
    Involving(UserId),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageQuery {
    pub filter: MessageFilter,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// History of a conversation scope, oldest first. `None` for the inbox scope,
    /// which has no history of its own.
    pub fn history(scope: &ScopeKey, limit: usize) -> Option<Self> {
        let filter = match scope {
            ScopeKey::Direct(pair) => MessageFilter::Between(*pair),
            ScopeKey::Group(group) => MessageFilter::Group(*group),
            ScopeKey::Inbox(_) => return None,
        };
        Some(Self {
            filter,
            order: SortOrder::Ascending,
            limit: Some(limit),
        })
    }

    /// Most recent direct messages of a user, newest first.
    pub fn recent_for(user: UserId, limit: usize) -> Self {
        Self {
            filter: MessageFilter::Involving(user),
            order: SortOrder::Descending,
            limit: Some(limit),
        }
    }
}

impl MessageFilter {
    pub fn matches(&self, row: &MessageRow) -> bool {
        match self {
            MessageFilter::Between(pair) => match row.receiver_id {
                Some(receiver) => {
                    receiver != row.sender_id
                        && pair.contains(receiver)
                        && pair.contains(row.sender_id)
                }
                None => false,
            },
            MessageFilter::Group(group) => row.group_id == Some(*group),
            MessageFilter::Involving(user) => {
                row.receiver_id.is_some()
                    && (row.sender_id == *user || row.receiver_id == Some(*user))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The backend returned the stored row with its assigned id and timestamp.
    Echoed(MessageRow),
    /// Stored, but the row will only be visible through the change feed.
    Accepted,
}

/// Acknowledgment fields to set. Backends only fill fields that are still null.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MessagePatch {
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn delivered(at: DateTime<Utc>) -> Self {
        Self {
            delivered_at: Some(at),
            seen_at: None,
        }
    }

    /// Seen implies delivered; delivered_at is filled too if still null.
    pub fn seen(at: DateTime<Utc>) -> Self {
        Self {
            delivered_at: Some(at),
            seen_at: Some(at),
        }
    }

    pub fn apply(&self, row: &mut MessageRow) -> bool {
        let mut changed = false;
        if let (None, Some(at)) = (row.delivered_at, self.delivered_at) {
            row.delivered_at = Some(at);
            changed = true;
        }
        if let (None, Some(at)) = (row.seen_at, self.seen_at) {
            row.seen_at = Some(at);
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct UpdateFilter {
    pub ids: Option<Vec<MessageId>>,
    pub sender: Option<UserId>,
    pub receiver: Option<UserId>,
    pub unseen_only: bool,
}

impl UpdateFilter {
    pub fn ids(ids: Vec<MessageId>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    /// receiver = me, sender = partner, seen_at is null
    pub fn unseen_from(partner: UserId, me: UserId) -> Self {
        Self {
            ids: None,
            sender: Some(partner),
            receiver: Some(me),
            unseen_only: true,
        }
    }

    pub fn matches(&self, row: &MessageRow) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&row.id) {
                return false;
            }
        }
        if let Some(sender) = self.sender {
            if row.sender_id != sender {
                return false;
            }
        }
        if let Some(receiver) = self.receiver {
            if row.receiver_id != Some(receiver) {
                return false;
            }
        }
        !(self.unseen_only && row.seen_at.is_some())
    }
}

#[async_trait::async_trait]
pub trait MessageRepo: Send + Sync {
    async fn query(&self, query: &MessageQuery) -> Result<Vec<MessageRow>, StoreError>;
    async fn insert(&self, row: &NewMessageRow) -> Result<InsertOutcome, StoreError>;
    /// Batched conditional update; returns the number of rows changed.
    async fn update(&self, patch: MessagePatch, filter: &UpdateFilter) -> Result<usize, StoreError>;
}
