use crate::domain_model::UserId;
use crate::domain_port::SessionProvider;

/// Identity that never changes for the lifetime of the provider.
#[derive(Debug, Clone, Copy)]
pub struct FixedSessionProvider {
    identity: Option<UserId>,
}

impl FixedSessionProvider {
    pub fn signed_in(user: UserId) -> Self {
        Self {
            identity: Some(user),
        }
    }

    pub fn signed_out() -> Self {
        Self { identity: None }
    }
}

#[async_trait::async_trait]
impl SessionProvider for FixedSessionProvider {
    async fn current_identity(&self) -> Option<UserId> {
        self.identity
    }
}
