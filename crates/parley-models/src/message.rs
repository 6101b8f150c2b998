use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attachment::MediaRef;
use crate::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(with = "crate::id_str")]
    pub id: MessageId,
    #[serde(with = "crate::id_str")]
    pub conversation_id: ConversationId,
    #[serde(with = "crate::id_str")]
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<MediaRef>,
    pub created_at: DateTime<Utc>,
    /// Participants who acknowledged the message. Never includes the sender.
    #[serde(with = "crate::id_str::vec")]
    pub read_by: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl Message {
    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.contains(&user_id)
    }
}
