use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum ConversationKind {
    Direct = 1,
    Group = 2,
}

impl ConversationKind {
    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            1 => Some(Self::Direct),
            2 => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Per-participant view of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    #[serde(with = "crate::id_str")]
    pub user_id: UserId,
    pub unread_count: u32,
    pub muted_until: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl ParticipantState {
    pub fn is_muted_at(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(with = "crate::id_str")]
    pub id: ConversationId,
    pub kind: ConversationKind,
    #[serde(with = "crate::id_str::option")]
    pub last_message_id: Option<MessageId>,
    pub last_activity_at: DateTime<Utc>,
    pub participants: Vec<ParticipantState>,
}

impl Conversation {
    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id).collect()
    }

    pub fn participant(&self, user_id: UserId) -> Option<&ParticipantState> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn unread_for(&self, user_id: UserId) -> Option<u32> {
        self.participant(user_id).map(|p| p.unread_count)
    }
}
