#[derive(Debug, Clone, thiserror::Error)]
pub enum BlobError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns their public url.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, BlobError>;
}
