use serde::{Deserialize, Serialize};

use crate::viewport::VisibleWindow;

/// Why an optimistic send ended in `Failed`.
#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailure {
    Network,
    Rejected,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Confirmed,
    Failed { reason: SendFailure },
}

impl MessageState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub url: String,
    pub title: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCount {
    pub reaction: String,
    pub count: u32,
}

/// One chat message regardless of where it came from (history page, live push,
/// or a local submission).
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Server id once confirmed, `tmp-<client_ref>` before that.
    pub id: String,
    pub client_ref: Option<String>,
    pub author_id: String,
    pub author_name: Option<String>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub state: MessageState,
    /// Insertion order assigned by the log; secondary sort key.
    pub seq: u64,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<ReactionCount>,
    pub thread_count: u32,
}

impl CanonicalMessage {
    pub(crate) fn sort_key(&self) -> (i64, u64) {
        (self.created_at, self.seq)
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Live,
    Reconnecting,
    SubscriptionLost { reason: String },
    Failed { reason: String },
    Closed,
}

impl FeedStatus {
    /// True once the initial history page has been merged at least once.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Live | Self::Reconnecting | Self::SubscriptionLost { .. }
        )
    }
}

/// Immutable snapshot of one conversation, republished after every batch of
/// log mutations.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Serialize)]
pub struct ConversationFeed {
    pub rev: u64,
    pub conversation_id: String,
    pub status: FeedStatus,
    pub messages: Vec<CanonicalMessage>,
    pub cursor: Option<String>,
    pub can_load_older: bool,
    pub loading_older: bool,
    pub confirmed_count: u32,
    pub pending_count: u32,
    pub failed_count: u32,
    pub window: VisibleWindow,
    pub visible: Vec<CanonicalMessage>,
}

impl ConversationFeed {
    pub fn empty(conversation_id: impl Into<String>) -> Self {
        Self {
            rev: 0,
            conversation_id: conversation_id.into(),
            status: FeedStatus::Connecting,
            messages: vec![],
            cursor: None,
            can_load_older: false,
            loading_older: false,
            confirmed_count: 0,
            pending_count: 0,
            failed_count: 0,
            window: VisibleWindow::default(),
            visible: vec![],
        }
    }

    pub fn message_by_ref(&self, client_ref: &str) -> Option<&CanonicalMessage> {
        self.messages
            .iter()
            .find(|m| m.client_ref.as_deref() == Some(client_ref))
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::{FeedStatus, MessageState, SendFailure};

    #[test]
    fn message_state_predicates() {
        assert!(MessageState::Pending.is_pending());
        assert!(MessageState::Confirmed.is_confirmed());
        let failed = MessageState::Failed {
            reason: SendFailure::Rejected,
        };
        assert!(failed.is_failed());
        assert!(!failed.is_pending());
        assert!(!failed.is_confirmed());
    }

    #[test]
    fn feed_status_readiness_mapping() {
        assert!(!FeedStatus::Connecting.is_ready());
        assert!(FeedStatus::Live.is_ready());
        assert!(FeedStatus::Reconnecting.is_ready());
        assert!(FeedStatus::SubscriptionLost {
            reason: "socket closed".to_string(),
        }
        .is_ready());
        assert!(!FeedStatus::Failed {
            reason: "boom".to_string(),
        }
        .is_ready());
        assert!(!FeedStatus::Closed.is_ready());
    }

    #[test]
    fn message_state_serializes_with_tag() {
        let json = serde_json::to_value(MessageState::Failed {
            reason: SendFailure::Network,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "reason": "network"}));
    }
}
