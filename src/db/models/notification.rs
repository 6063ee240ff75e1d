//! Per-user notification records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    Booking,
    Payment,
    Review,
    System,
    Other,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Booking => write!(f, "booking"),
            Self::Payment => write!(f, "payment"),
            Self::Review => write!(f, "review"),
            Self::System => write!(f, "system"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "booking" => Ok(Self::Booking),
            "payment" => Ok(Self::Payment),
            "review" => Ok(Self::Review),
            "system" => Ok(Self::System),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown notification kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub related_entity_id: Option<String>,
    pub related_entity_kind: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub read: bool,
    pub created_at: String,
}

/// Reference to the entity a notification points at, e.g. the conversation
/// a new support message belongs to.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub id: String,
    pub kind: String,
}
