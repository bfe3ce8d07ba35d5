use crate::domain_port::*;
use crate::infra_memory::MemoryDatabase;
use std::sync::Arc;

pub struct MemoryBlobStore {
    db: Arc<MemoryDatabase>,
}

impl MemoryBlobStore {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        if !self.db.is_online() {
            return Err(BlobError::Unavailable("backend offline".to_owned()));
        }
        if bytes.is_empty() {
            return Err(BlobError::Rejected(format!("{path} is empty")));
        }
        Ok(self.db.store_blob(bucket, path, bytes))
    }
}
