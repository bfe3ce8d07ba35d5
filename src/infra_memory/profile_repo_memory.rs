use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::MemoryDatabase;
use std::sync::Arc;

pub struct MemoryProfileRepo {
    db: Arc<MemoryDatabase>,
}

impl MemoryProfileRepo {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl ProfileRepo for MemoryProfileRepo {
    async fn get_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>, StoreError> {
        Ok(self.db.profiles(ids))
    }
}
