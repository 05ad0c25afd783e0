use serde_json::Value;

use crate::actions::FeedAction;
use crate::error::{SendError, SessionError};
use crate::session::{FeedSession, HistoryPage};
use crate::state::{ConversationFeed, MessageState};

#[derive(uniffi::Enum, Clone, Debug)]
pub enum FeedUpdate {
    FullState(ConversationFeed),
    /// Emitted right after the `FullState` that already reflects the outcome.
    SendSettled {
        rev: u64,
        client_ref: String,
        state: MessageState,
    },
}

impl FeedUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            FeedUpdate::FullState(s) => s.rev,
            FeedUpdate::SendSettled { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(FeedAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Session lifecycle. `token` identifies the session generation; results
    // carrying an older token are dropped.
    SessionOpened {
        token: u64,
        result: Result<(FeedSession, HistoryPage), SessionError>,
    },
    LiveEvent {
        token: u64,
        payload: Value,
    },
    SubscriptionLost {
        token: u64,
        reason: String,
    },
    OlderHistoryLoaded {
        token: u64,
        result: Result<HistoryPage, SessionError>,
    },

    // Async send result
    SendCompleted {
        client_ref: String,
        result: Result<Value, SendError>,
    },
}
