//! Ordered, append-biased store of canonical messages.
//!
//! Entries are kept sorted by `(created_at, seq)`. Optimistic entries live in
//! the same vector as confirmed ones and are upgraded in place when their
//! confirmation shows up, so a message never changes its `seq` slot.

use std::collections::HashSet;

use crate::state::{CanonicalMessage, MessageState, SendFailure};

/// Above this many entries behind the partition point, settling switches from
/// insertion sort to a stable sort of the suffix.
const TAIL_INSERTION_LIMIT: usize = 64;

pub const DEFAULT_ECHO_MATCH_WINDOW_MS: i64 = 10_000;

/// What a mutation did to the externally visible sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogChange {
    #[default]
    Unchanged,
    /// Content changed at or after `from`; every entry kept its position.
    InPlace { from: usize },
    /// Entries were added at `from..`; nothing before `from` moved.
    Appended { from: usize },
    /// Positions at or after `from` may differ (including the length).
    Reordered { from: usize },
}

impl LogChange {
    pub fn ordering_changed(self) -> bool {
        matches!(self, Self::Appended { .. } | Self::Reordered { .. })
    }

    pub fn is_unchanged(self) -> bool {
        self == Self::Unchanged
    }

    /// Combine two changes observed back to back.
    pub fn merge(self, other: LogChange) -> LogChange {
        use LogChange::*;
        match (self, other) {
            (Unchanged, c) | (c, Unchanged) => c,
            (Reordered { from: a }, Reordered { from: b }) => Reordered { from: a.min(b) },
            (Reordered { from: a }, Appended { from: b })
            | (Appended { from: b }, Reordered { from: a }) => Reordered { from: a.min(b) },
            (Reordered { from }, InPlace { .. }) | (InPlace { .. }, Reordered { from }) => {
                Reordered { from }
            }
            (Appended { from: a }, Appended { from: b }) => Appended { from: a.min(b) },
            (Appended { from }, InPlace { .. }) | (InPlace { .. }, Appended { from }) => {
                Appended { from }
            }
            (InPlace { from: a }, InPlace { from: b }) => InPlace { from: a.min(b) },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilingLog {
    entries: Vec<CanonicalMessage>,
    // Every id currently in `entries`, temporary ids included.
    ids: HashSet<String>,
    // Every client_ref ever accepted; guards against a second optimistic insert.
    refs: HashSet<String>,
    next_seq: u64,
    echo_match_window_ms: Option<i64>,
}

impl ReconcilingLog {
    pub fn new() -> Self {
        Self::with_echo_match_window(Some(DEFAULT_ECHO_MATCH_WINDOW_MS))
    }

    /// `None` (or a non-positive window) disables matching echoes that carry no
    /// client_ref against pending entries.
    pub fn with_echo_match_window(window_ms: Option<i64>) -> Self {
        Self {
            echo_match_window_ms: window_ms.filter(|w| *w > 0),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CanonicalMessage> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[CanonicalMessage] {
        &self.entries
    }

    /// Entries `start..=end`, clamped to the log.
    pub fn slice(&self, start: usize, end: usize) -> &[CanonicalMessage] {
        let end = end.saturating_add(1).min(self.entries.len());
        &self.entries[start.min(end)..end]
    }

    pub fn snapshot(&self) -> Vec<CanonicalMessage> {
        self.entries.clone()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn confirmed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state.is_confirmed())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.state.is_pending()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.state.is_failed()).count()
    }

    pub fn tail_created_at(&self) -> Option<i64> {
        self.entries.last().map(|e| e.created_at)
    }

    pub fn load_history(&mut self, records: Vec<CanonicalMessage>) -> LogChange {
        if records.is_empty() {
            return LogChange::Unchanged;
        }
        let prior: Vec<u64> = self.entries.iter().map(|e| e.seq).collect();
        let mut edited_from: Option<usize> = None;
        let mut note_edit = |index: usize| {
            edited_from = Some(edited_from.map_or(index, |i: usize| i.min(index)));
        };

        for record in records {
            if let Some(index) = record
                .client_ref
                .as_deref()
                .and_then(|r| self.unconfirmed_index(r))
            {
                let (index, _) = self.merge_confirmed(index, record);
                note_edit(index);
                continue;
            }
            if self.ids.contains(&record.id) {
                if let Some(index) = self.refresh_existing(record) {
                    note_edit(index);
                }
                continue;
            }
            if let Some(index) = self.echo_match_index(&record) {
                let (index, _) = self.merge_confirmed(index, record);
                note_edit(index);
                continue;
            }
            self.push_confirmed(record);
        }

        self.entries.sort_by_key(CanonicalMessage::sort_key);

        let first_moved = prior
            .iter()
            .zip(&self.entries)
            .position(|(seq, e)| *seq != e.seq);
        let len = self.entries.len();
        match first_moved {
            Some(from) => LogChange::Reordered { from },
            None if len < prior.len() => LogChange::Reordered { from: len },
            None if len > prior.len() => LogChange::Appended { from: prior.len() },
            None => edited_from.map_or(LogChange::Unchanged, |from| LogChange::InPlace { from }),
        }
    }

    pub fn apply_live_event(&mut self, record: CanonicalMessage) -> LogChange {
        if let Some(index) = record
            .client_ref
            .as_deref()
            .and_then(|r| self.unconfirmed_index(r))
        {
            return self.confirm_at(index, record);
        }
        if self.ids.contains(&record.id) {
            return match self.refresh_existing(record) {
                Some(from) => LogChange::InPlace { from },
                None => LogChange::Unchanged,
            };
        }
        if let Some(index) = self.echo_match_index(&record) {
            return self.confirm_at(index, record);
        }
        let from = self.entries.len();
        self.push_confirmed(record);
        self.settle_from(from)
    }

    /// Appends a pending entry at the tail. A `client_ref` the log has already
    /// seen (pending, failed, or confirmed first by a racing echo) is ignored.
    pub fn insert_optimistic(&mut self, mut record: CanonicalMessage) -> LogChange {
        let Some(client_ref) = record.client_ref.clone() else {
            tracing::warn!(id = %record.id, "optimistic insert without client_ref ignored");
            return LogChange::Unchanged;
        };
        if self.refs.contains(&client_ref) || self.ids.contains(&record.id) {
            tracing::debug!(%client_ref, "client_ref already known, skipping optimistic insert");
            return LogChange::Unchanged;
        }
        record.seq = self.take_seq();
        record.state = MessageState::Pending;
        // Rendered at the end no matter what the local clock says.
        if let Some(tail) = self.tail_created_at() {
            record.created_at = record.created_at.max(tail);
        }
        self.refs.insert(client_ref);
        self.ids.insert(record.id.clone());
        self.entries.push(record);
        LogChange::Appended {
            from: self.entries.len() - 1,
        }
    }

    pub fn confirm_optimistic(
        &mut self,
        client_ref: &str,
        mut confirmed: CanonicalMessage,
    ) -> LogChange {
        if confirmed.client_ref.is_none() {
            confirmed.client_ref = Some(client_ref.to_string());
        }
        match self.unconfirmed_index(client_ref) {
            Some(index) => self.confirm_at(index, confirmed),
            None => self.apply_live_event(confirmed),
        }
    }

    pub fn fail_optimistic(&mut self, client_ref: &str, reason: SendFailure) -> LogChange {
        let Some(index) = self
            .entries
            .iter()
            .rposition(|e| e.state.is_pending() && e.client_ref.as_deref() == Some(client_ref))
        else {
            return LogChange::Unchanged;
        };
        self.entries[index].state = MessageState::Failed { reason };
        LogChange::InPlace { from: index }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push_confirmed(&mut self, mut record: CanonicalMessage) {
        record.seq = self.take_seq();
        record.state = MessageState::Confirmed;
        if let Some(r) = &record.client_ref {
            self.refs.insert(r.clone());
        }
        self.ids.insert(record.id.clone());
        self.entries.push(record);
    }

    fn unconfirmed_index(&self, client_ref: &str) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| !e.state.is_confirmed() && e.client_ref.as_deref() == Some(client_ref))
    }

    /// Oldest pending entry that looks like the echo of `record`: same author,
    /// same text, created within the match window. Only used when the echo has
    /// no client_ref of its own.
    fn echo_match_index(&self, record: &CanonicalMessage) -> Option<usize> {
        let window = self.echo_match_window_ms?;
        if record.client_ref.is_some() {
            return None;
        }
        self.entries.iter().position(|e| {
            e.state.is_pending()
                && e.author_id == record.author_id
                && e.text == record.text
                && e.created_at.abs_diff(record.created_at) <= window as u64
        })
    }

    fn confirm_at(&mut self, index: usize, confirmed: CanonicalMessage) -> LogChange {
        let (index, removed) = self.merge_confirmed(index, confirmed);
        let change = LogChange::InPlace { from: index }.merge(self.reposition(index));
        match removed {
            Some(dup) => change.merge(LogChange::Reordered { from: dup.min(index) }),
            None => change,
        }
    }

    /// Upgrades the unconfirmed entry at `index` with the server's record,
    /// keeping its `seq`. If the server id already sits in the log as a
    /// separate entry (echo appended before the send returned), that copy is
    /// folded away. Returns the entry's index afterwards and the removed index.
    fn merge_confirmed(
        &mut self,
        mut index: usize,
        confirmed: CanonicalMessage,
    ) -> (usize, Option<usize>) {
        let mut removed = None;
        if confirmed.id != self.entries[index].id && self.ids.contains(&confirmed.id) {
            if let Some(dup) = self.entries.iter().position(|e| e.id == confirmed.id) {
                self.entries.remove(dup);
                if dup < index {
                    index -= 1;
                }
                removed = Some(dup);
            }
        }

        let entry = &mut self.entries[index];
        self.ids.remove(&entry.id);
        self.ids.insert(confirmed.id.clone());
        entry.id = confirmed.id;
        entry.created_at = confirmed.created_at;
        entry.updated_at = confirmed.updated_at;
        if !confirmed.text.is_empty() {
            entry.text = confirmed.text;
        }
        if confirmed.author_name.is_some() {
            entry.author_name = confirmed.author_name;
        }
        entry.attachments = confirmed.attachments;
        entry.reactions = confirmed.reactions;
        entry.thread_count = confirmed.thread_count;
        entry.state = MessageState::Confirmed;
        (index, removed)
    }

    /// Applies an edit carried by a re-delivered confirmed record. Returns the
    /// index when something changed; plain duplicates are no-ops.
    fn refresh_existing(&mut self, record: CanonicalMessage) -> Option<usize> {
        let index = self.entries.iter().rposition(|e| e.id == record.id)?;
        let entry = &mut self.entries[index];
        let newer = match (record.updated_at, entry.updated_at) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            _ => false,
        };
        if !newer || !entry.state.is_confirmed() {
            return None;
        }
        entry.text = record.text;
        entry.updated_at = record.updated_at;
        entry.attachments = record.attachments;
        entry.reactions = record.reactions;
        entry.thread_count = record.thread_count;
        Some(index)
    }

    /// Restores order after entries were pushed at `from..`. The sorted prefix
    /// is left alone up to the partition point of the smallest new key.
    fn settle_from(&mut self, from: usize) -> LogChange {
        let len = self.entries.len();
        if from >= len {
            return LogChange::Unchanged;
        }
        let Some(min_key) = self.entries[from..]
            .iter()
            .map(CanonicalMessage::sort_key)
            .min()
        else {
            return LogChange::Unchanged;
        };
        let start = self.entries[..from].partition_point(|e| e.sort_key() <= min_key);
        let suffix = &mut self.entries[start..];
        if suffix.len() <= TAIL_INSERTION_LIMIT {
            insertion_sort(suffix);
        } else {
            suffix.sort_by_key(CanonicalMessage::sort_key);
        }
        if start == from {
            LogChange::Appended { from }
        } else {
            LogChange::Reordered { from: start }
        }
    }

    /// Moves the entry at `index` to its sorted position after its key changed.
    fn reposition(&mut self, index: usize) -> LogChange {
        let mut i = index;
        while i > 0 && self.entries[i - 1].sort_key() > self.entries[i].sort_key() {
            self.entries.swap(i - 1, i);
            i -= 1;
        }
        if i != index {
            return LogChange::Reordered { from: i };
        }
        while i + 1 < self.entries.len()
            && self.entries[i].sort_key() > self.entries[i + 1].sort_key()
        {
            self.entries.swap(i, i + 1);
            i += 1;
        }
        if i != index {
            LogChange::Reordered { from: index }
        } else {
            LogChange::Unchanged
        }
    }
}

fn insertion_sort(items: &mut [CanonicalMessage]) {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && items[j - 1].sort_key() > items[j].sort_key() {
            items.swap(j - 1, j);
            j -= 1;
        }
    }
}
