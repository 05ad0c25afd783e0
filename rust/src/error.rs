use crate::state::SendFailure;

/// A raw event that cannot be turned into a `CanonicalMessage`. The event is
/// dropped; the feed keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("event payload is not a JSON object")]
    NotAnObject,
    #[error("unsupported event type `{0}`")]
    UnsupportedType(String),
    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

/// Transport-level outcome of a failed send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl SendError {
    pub fn failure(&self) -> SendFailure {
        match self {
            Self::Network(_) => SendFailure::Network,
            Self::Rejected(_) => SendFailure::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("history request failed: {0}")]
    History(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed initialization failed: {0}")]
    Init(String),
    #[error("timed out waiting for the feed")]
    Timeout,
    #[error("message text is empty")]
    EmptyMessage,
    #[error("client_ref `{0}` is already in use")]
    DuplicateClientRef(String),
    #[error("feed is closed")]
    Closed,
    #[error("failed to start feed runtime: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_maps_to_failure_kind() {
        assert_eq!(
            SendError::Network("timeout".into()).failure(),
            SendFailure::Network
        );
        assert_eq!(
            SendError::Rejected("slow mode".into()).failure(),
            SendFailure::Rejected
        );
    }

    #[test]
    fn malformed_event_messages_name_the_field() {
        let err = MalformedEventError::MissingField("created_at");
        assert_eq!(err.to_string(), "missing mandatory field `created_at`");
    }
}
