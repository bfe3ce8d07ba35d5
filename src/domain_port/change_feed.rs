use crate::domain_model::*;
use futures_util::stream::BoxStream;
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Equality filter on one column, rendered as `column=eq.value`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FeedFilter {
    pub column: String,
    pub value: String,
}

impl FeedFilter {
    pub fn eq(column: &str, value: impl fmt::Display) -> Self {
        Self {
            column: column.to_owned(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What a subscription listens to. An event matches if any filter matches.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeedScope {
    pub channel: String,
    pub table: String,
    pub kinds: Vec<ChangeKind>,
    pub filters: Vec<FeedFilter>,
}

impl FeedScope {
    /// Filters for one scope key. Conversation scopes never overlap each
    /// other. The inbox overlaps the open direct conversation on inserts
    /// addressed to this user; such an insert reaches the session twice and
    /// only the conversation handle acknowledges it.
    pub fn for_scope(scope: &ScopeKey) -> Self {
        let filters = match scope {
            ScopeKey::Direct(pair) => vec![
                FeedFilter::eq("receiver_id", pair.first()),
                FeedFilter::eq("receiver_id", pair.second()),
            ],
            ScopeKey::Group(group) => vec![FeedFilter::eq("group_id", group)],
            ScopeKey::Inbox(me) => vec![FeedFilter::eq("receiver_id", me)],
        };
        let kinds = match scope {
            ScopeKey::Inbox(_) => vec![ChangeKind::Insert],
            _ => vec![ChangeKind::Insert, ChangeKind::Update],
        };
        Self {
            channel: scope.channel_name(),
            table: MESSAGES_TABLE.to_owned(),
            kinds,
            filters,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self.kinds.contains(&event.kind)
            && self.filters.iter().any(|f| f.matches(&event.row))
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Change(ChangeEvent),
    /// The transport dropped; the stream yields nothing more.
    Disconnected(String),
}

pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: BoxStream<'static, FeedSignal>,
}

impl fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("id", &self.id)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: FeedScope) -> Result<FeedSubscription, FeedError>;
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(sender: UserId, receiver: UserId) -> ChangeEvent {
        ChangeEvent::new(
            ChangeKind::Insert,
            MESSAGES_TABLE,
            json!({
                "sender_id": sender.to_string(),
                "receiver_id": receiver.to_string(),
                "group_id": null,
            }),
        )
    }

    #[test]
    fn inbox_overlaps_only_on_inserts_addressed_to_me() {
        let me = UserId::from_handle("me");
        let bob = UserId::from_handle("bob");
        let carol = UserId::from_handle("carol");
        let with_bob = FeedScope::for_scope(&ScopeKey::direct(me, bob));
        let with_carol = FeedScope::for_scope(&ScopeKey::direct(me, carol));
        let inbox = FeedScope::for_scope(&ScopeKey::Inbox(me));

        let from_bob = insert(bob, me);
        assert!(with_bob.matches(&from_bob));
        assert!(inbox.matches(&from_bob));

        let to_bob = insert(me, bob);
        assert!(with_bob.matches(&to_bob));
        assert!(!inbox.matches(&to_bob));
        assert!(!with_carol.matches(&to_bob));

        let mut ack = from_bob.clone();
        ack.kind = ChangeKind::Update;
        assert!(with_bob.matches(&ack));
        assert!(!inbox.matches(&ack));
    }
}
