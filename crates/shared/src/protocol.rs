use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ConversationKind, EventId, MessageId, UserId};

/// Request half of the duplex channel. Every call is wrapped in a
/// [`CallFrame`] carrying the correlation id the server echoes back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCall {
    JoinUserRoom {
        user_id: UserId,
    },
    CreatePrivateConversation {
        peer_id: UserId,
    },
    CreateEventConversation {
        event_id: EventId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    GetConversation {
        conversation_id: ConversationId,
    },
    ListConversations,
    MarkConversationRead {
        conversation_id: ConversationId,
    },
    GetUnreadCounts,
    GetTotalUnreadCount,
    GetUsersStatus {
        user_ids: Vec<UserId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallFrame {
    pub id: u64,
    #[serde(flatten)]
    pub call: ClientCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResult {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CallResult {
    pub fn ok(id: u64, data: impl Serialize) -> Self {
        Self {
            id,
            success: true,
            message: None,
            data: serde_json::to_value(data).ok(),
        }
    }

    pub fn rejected(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Server-initiated events. A closed union: unknown event names are a
/// protocol error, not an open-ended payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPush {
    NewMessage {
        message: MessagePayload,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    CallResult(CallResult),
    Event(ServerPush),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadCount {
    pub conversation_id: ConversationId,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStatus {
    pub user_id: UserId,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub user_id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}
