use crate::domain_model::UserId;
use crate::domain_port::*;
use crate::infra_memory::MemoryDatabase;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;

/// Change feed of the in-memory backend. Events are filtered by the
/// subscriber's scope and by what its identity may see.
pub struct MemoryChangeFeed {
    db: Arc<MemoryDatabase>,
    viewer: UserId,
}

impl MemoryChangeFeed {
    pub fn new(db: Arc<MemoryDatabase>, viewer: UserId) -> Self {
        Self { db, viewer }
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, scope: FeedScope) -> Result<FeedSubscription, FeedError> {
        let (id, rx) = self.db.subscribe(self.viewer, scope)?;
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        })
        .boxed();
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), FeedError> {
        self.db.unsubscribe(id);
        Ok(())
    }
}
