use crate::domain_model::UserId;

#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    /// The authenticated identity, if any.
    async fn current_identity(&self) -> Option<UserId>;
}
