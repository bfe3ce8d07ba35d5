use crate::domain_model::*;
use crate::domain_port::{BlobError, FeedError, StoreError};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no authenticated identity")]
    NotAuthenticated,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("message is empty")]
    EmptyMessage,
    #[error("activation superseded by a newer one")]
    Superseded,
    #[error("session disposed")]
    Disposed,
    #[error("send {local_id} failed: {source}")]
    SendFailed {
        local_id: LocalId,
        #[source]
        source: StoreError,
    },
    #[error("no failed send with id {0}")]
    UnknownLocal(LocalId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ListenerId(pub u64);

/// Which view a change notification concerns.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StoreChange {
    Messages,
    Conversations,
}

pub type StoreListener = Arc<dyn Fn(StoreChange) + Send + Sync>;

/// What UI bindings drive. One instance per signed-in session.
#[async_trait::async_trait]
pub trait MessagingService: Send + Sync {
    /// Makes the direct conversation with `partner` the active one: tears the
    /// previous subscription down, opens the new one and loads history.
    async fn activate_conversation(&self, partner: UserId) -> Result<(), SyncError>;
    async fn activate_group(&self, group: GroupId) -> Result<(), SyncError>;
    async fn deactivate(&self);

    /// Appends an optimistic entry and writes it. Returns the stored key when
    /// the confirmed row is already known, the temporary key otherwise.
    async fn send_message(&self, content: &str) -> Result<MessageKey, SyncError>;
    async fn send_media(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        caption: &str,
    ) -> Result<MessageKey, SyncError>;
    async fn retry_send(&self, local_id: &LocalId) -> Result<MessageKey, SyncError>;

    fn active_scope(&self) -> Option<ScopeKey>;
    fn ordered_messages(&self) -> Vec<Message>;
    fn delivery_state(&self, key: &MessageKey) -> Option<DeliveryState>;

    fn on_store_changed(&self, listener: StoreListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
    /// Revision counter bumped on every notified change.
    fn changes(&self) -> watch::Receiver<u64>;

    /// The active thread is on screen; marks incoming messages seen in one
    /// batched write. Returns the number of rows the write changed.
    async fn thread_rendered(&self) -> Result<usize, SyncError>;

    async fn load_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError>;
    fn conversations(&self) -> Vec<ConversationSummary>;

    /// Reloads the active history and merges whatever was missed.
    async fn reconcile(&self) -> Result<usize, SyncError>;

    async fn dispose(&self);
}
