use crate::domain_model::*;
use crate::domain_port::StoreError;

#[async_trait::async_trait]
pub trait ProfileRepo: Send + Sync {
    /// Profiles for the given ids; unknown ids are skipped.
    async fn get_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>, StoreError>;
}
