//! Support conversation and embedded message models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Conversation lifecycle. Closed is terminal except for the reopen edge
/// taken when the initiating user posts a new message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Assigned,
    InProgress,
    Resolved,
    Closed,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown conversation status: {}", s)),
        }
    }
}

/// Message embedded in a conversation's JSON message list. Append-only;
/// only the `read` flag is ever mutated after the fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: String,
    pub text: String,
    #[serde(default)]
    pub read: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SupportConversation {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub user_role: String,
    pub subject: String,
    pub status: String,
    pub assigned_to: Option<String>,
    /// Snapshot of the assignee's display name; refreshed best-effort when
    /// the admin renames themselves.
    pub assigned_agent_name: Option<String>,
    pub priority: String,
    /// JSON-serialized `Vec<Message>`
    pub messages: String,
    pub last_message_at: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SupportConversation {
    pub fn status(&self) -> ConversationStatus {
        self.status.parse().unwrap_or(ConversationStatus::Open)
    }

    pub fn messages(&self) -> Vec<Message> {
        serde_json::from_str(&self.messages).unwrap_or_default()
    }
}

/// Response DTO with the message list materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub user_role: String,
    pub subject: String,
    pub status: String,
    pub assigned_to: Option<String>,
    pub assigned_agent_name: Option<String>,
    pub priority: String,
    pub messages: Vec<Message>,
    pub last_message_at: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SupportConversation> for ConversationResponse {
    fn from(conv: SupportConversation) -> Self {
        let messages = conv.messages();
        Self {
            id: conv.id,
            user_id: conv.user_id,
            user_name: conv.user_name,
            user_email: conv.user_email,
            user_role: conv.user_role,
            subject: conv.subject,
            status: conv.status,
            assigned_to: conv.assigned_to,
            assigned_agent_name: conv.assigned_agent_name,
            priority: conv.priority,
            messages,
            last_message_at: conv.last_message_at,
            resolved_at: conv.resolved_at,
            created_at: conv.created_at,
            updated_at: conv.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub subject: String,
    pub message: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}
