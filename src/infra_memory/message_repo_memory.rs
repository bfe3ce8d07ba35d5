use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::MemoryDatabase;
use std::sync::Arc;

/// Message table access on behalf of one identity.
pub struct MemoryMessageRepo {
    db: Arc<MemoryDatabase>,
    viewer: UserId,
}

impl MemoryMessageRepo {
    pub fn new(db: Arc<MemoryDatabase>, viewer: UserId) -> Self {
        Self { db, viewer }
    }
}

#[async_trait::async_trait]
impl MessageRepo for MemoryMessageRepo {
    async fn query(&self, query: &MessageQuery) -> Result<Vec<MessageRow>, StoreError> {
        self.db.query(self.viewer, query).await
    }

    async fn insert(&self, row: &NewMessageRow) -> Result<InsertOutcome, StoreError> {
        self.db.insert(self.viewer, row).await
    }

    async fn update(&self, patch: MessagePatch, filter: &UpdateFilter) -> Result<usize, StoreError> {
        self.db.update(self.viewer, patch, filter).await
    }
}
