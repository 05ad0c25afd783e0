use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FeedError;
use crate::normalize::LocalSubmission;
use crate::state::now_millis;

/// Session-unique client references: `<random prefix>-<counter>`.
#[derive(Debug)]
pub struct ClientRefGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl Default for ClientRefGenerator {
    fn default() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self::with_prefix(&uuid[..8])
    }
}

impl ClientRefGenerator {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_ref(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.prefix)
    }
}

/// Actor-side bookkeeping for sends in flight.
#[derive(Debug)]
pub(crate) struct SendCoordinator {
    identity: String,
    in_flight: HashSet<String>,
    last_local_ts: i64,
}

impl SendCoordinator {
    pub(crate) fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            in_flight: HashSet::new(),
            last_local_ts: 0,
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Registers a send and builds its local submission. Timestamps never go
    /// backwards within a session, even if the wall clock does.
    pub(crate) fn begin(
        &mut self,
        client_ref: &str,
        text: &str,
    ) -> Result<LocalSubmission, FeedError> {
        if text.trim().is_empty() {
            return Err(FeedError::EmptyMessage);
        }
        if client_ref.trim().is_empty() || !self.in_flight.insert(client_ref.to_string()) {
            tracing::warn!(client_ref, "duplicate or empty client_ref, ignoring submit");
            return Err(FeedError::DuplicateClientRef(client_ref.to_string()));
        }
        let created_at = now_millis().max(self.last_local_ts + 1);
        self.last_local_ts = created_at;
        Ok(LocalSubmission {
            client_ref: client_ref.to_string(),
            author_id: self.identity.clone(),
            text: text.to_string(),
            created_at,
        })
    }

    /// Returns false for a client_ref that was never begun or already settled.
    pub(crate) fn settle(&mut self, client_ref: &str) -> bool {
        self.in_flight.remove(client_ref)
    }

    pub(crate) fn abandon_all(&mut self) -> Vec<String> {
        self.in_flight.drain().collect()
    }
}
