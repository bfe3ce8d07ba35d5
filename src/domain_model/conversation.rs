use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePreview {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub from_me: bool,
}

impl MessagePreview {
    pub fn of(message: &Message, me: UserId) -> Self {
        Self {
            content: message.content.clone(),
            created_at: message.created_at,
            from_me: message.sender == me,
        }
    }
}

/// One entry per distinct direct-conversation partner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub partner_id: UserId,
    pub partner: Option<Profile>,
    pub last_message: Option<MessagePreview>,
}
