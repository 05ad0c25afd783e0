mod config;
mod send;

use std::sync::{Arc, RwLock};

use flume::{Receiver, Sender};
use serde_json::Value;

use crate::actions::FeedAction;
use crate::error::{FeedError, MalformedEventError, SendError, SessionError};
use crate::message_log::{LogChange, ReconcilingLog};
use crate::normalize::{normalize, RawEvent};
use crate::session::{self, FeedSession, HistoryPage, LiveSink, OutgoingMessage, SessionProvider};
use crate::state::{ConversationFeed, FeedStatus, MessageState, SendFailure};
use crate::updates::{CoreMsg, FeedUpdate, InternalEvent};
use crate::viewport::ViewportIndexer;

pub use config::{default_config_json, load_feed_config, FeedConfig, CONFIG_FILE_NAME};
pub use send::ClientRefGenerator;
use send::SendCoordinator;

/// Upper bound on queued messages folded into one published snapshot.
const MAX_MESSAGES_PER_TICK: usize = 256;

/// Who the feed is for and where it comes from.
pub struct FeedTarget {
    pub identity: String,
    pub conversation_id: String,
    pub provider: Arc<dyn SessionProvider>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScrollAnchor {
    Tail,
    Offset(f64),
}

pub struct FeedCore {
    pub state: ConversationFeed,
    rev: u64,

    update_sender: Sender<FeedUpdate>,
    core_sender: Sender<CoreMsg>,
    status_sender: Sender<()>,
    shared_state: Arc<RwLock<ConversationFeed>>,

    config: FeedConfig,
    runtime: tokio::runtime::Runtime,
    identity: String,
    provider: Arc<dyn SessionProvider>,

    session: Option<FeedSession>,
    session_token: u64,
    connecting: bool,
    // True once a first history page has been merged.
    initialized: bool,
    // Live events that arrived for the current token before the session landed.
    buffered_live: Vec<Value>,
    lost_while_connecting: Option<String>,

    log: ReconcilingLog,
    coordinator: SendCoordinator,
    viewport: ViewportIndexer,
    anchor: ScrollAnchor,
    viewport_height: f64,

    dirty: bool,
    status_changed: bool,
    settled: Vec<(String, MessageState)>,
    closed: bool,
}

impl FeedCore {
    pub fn new(
        update_sender: Sender<FeedUpdate>,
        core_sender: Sender<CoreMsg>,
        status_sender: Sender<()>,
        shared_state: Arc<RwLock<ConversationFeed>>,
        runtime: tokio::runtime::Runtime,
        config: FeedConfig,
        target: FeedTarget,
    ) -> Self {
        let state = ConversationFeed::empty(target.conversation_id);
        let mut this = Self {
            state,
            rev: 0,
            update_sender,
            core_sender,
            status_sender,
            shared_state,
            runtime,
            identity: target.identity.clone(),
            provider: target.provider,
            session: None,
            session_token: 0,
            connecting: false,
            initialized: false,
            buffered_live: Vec::new(),
            lost_while_connecting: None,
            log: ReconcilingLog::new(),
            coordinator: SendCoordinator::new(target.identity),
            viewport: ViewportIndexer::new(config.estimated_item_height(), config.overscan()),
            anchor: ScrollAnchor::Tail,
            viewport_height: config.viewport_height(),
            config,
            dirty: false,
            status_changed: false,
            settled: Vec::new(),
            closed: false,
        };
        this.log = ReconcilingLog::with_echo_match_window(this.echo_match_window());

        // Ensure FeedApp::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    /// Actor loop: drains a batch of queued messages, then publishes once.
    pub fn run(mut self, rx: Receiver<CoreMsg>) {
        self.open_session();
        self.flush();
        while let Ok(msg) = rx.recv() {
            self.tick(msg, &rx);
            if self.closed {
                break;
            }
        }
        self.shutdown();
        tracing::debug!(conversation_id = %self.state.conversation_id, "feed actor stopped");
    }

    /// Handles `first` plus whatever is already queued, up to the tick limit,
    /// then publishes at most one snapshot.
    fn tick(&mut self, first: CoreMsg, rx: &Receiver<CoreMsg>) {
        self.handle_message(first);
        let mut handled = 1;
        while handled < MAX_MESSAGES_PER_TICK && !self.closed {
            let Ok(msg) = rx.try_recv() else {
                break;
            };
            self.handle_message(msg);
            handled += 1;
        }
        self.flush();
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &ConversationFeed) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(FeedUpdate::FullState(snapshot));
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.refresh_view();
        self.emit_state();
        let rev = self.rev;
        for (client_ref, state) in std::mem::take(&mut self.settled) {
            let _ = self.update_sender.send(FeedUpdate::SendSettled {
                rev,
                client_ref,
                state,
            });
        }
        if std::mem::take(&mut self.status_changed) {
            let _ = self.status_sender.try_send(());
        }
    }

    fn refresh_view(&mut self) {
        let total = self.log.len();
        let offset = match self.anchor {
            ScrollAnchor::Tail => self.viewport.tail_offset(total, self.viewport_height),
            ScrollAnchor::Offset(offset) => offset,
        };
        let window = self
            .viewport
            .compute_visible(total, offset, self.viewport_height);
        self.state.visible = if window.is_empty() {
            vec![]
        } else {
            self.log
                .slice(window.start_index as usize, window.end_index as usize)
                .to_vec()
        };
        self.state.window = window;
        self.state.messages = self.log.snapshot();
        self.state.confirmed_count = self.log.confirmed_count() as u32;
        self.state.pending_count = self.log.pending_count() as u32;
        self.state.failed_count = self.log.failed_count() as u32;
    }

    fn set_status(&mut self, status: FeedStatus) {
        if self.state.status != status {
            tracing::info!(from = ?self.state.status, to = ?status, "feed status");
            self.state.status = status;
            self.status_changed = true;
            self.dirty = true;
        }
    }

    fn record_change(&mut self, change: LogChange) {
        if change.is_unchanged() {
            return;
        }
        self.viewport.apply(change);
        self.dirty = true;
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: it carries message text.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: FeedAction) {
        if self.closed {
            return;
        }
        match action {
            FeedAction::Submit { client_ref, text } => self.submit(client_ref, text),
            FeedAction::LoadOlder => self.load_older(),
            FeedAction::SetViewport {
                scroll_offset,
                viewport_height,
            } => {
                self.anchor = match scroll_offset {
                    Some(offset) if offset.is_finite() => ScrollAnchor::Offset(offset),
                    _ => ScrollAnchor::Tail,
                };
                self.viewport_height = if viewport_height.is_finite() {
                    viewport_height.max(0.0)
                } else {
                    0.0
                };
                self.dirty = true;
            }
            FeedAction::MeasureItem { index, height } => {
                self.viewport.set_item_height(index as usize, height);
                self.dirty = true;
            }
            FeedAction::Reconnect => {
                let can_reconnect = matches!(
                    self.state.status,
                    FeedStatus::SubscriptionLost { .. } | FeedStatus::Failed { .. }
                );
                if self.connecting || !can_reconnect {
                    tracing::debug!(status = ?self.state.status, "reconnect ignored");
                    return;
                }
                self.open_session();
            }
            FeedAction::Close => {
                self.shutdown();
                self.set_status(FeedStatus::Closed);
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SessionOpened { token, result } => {
                // Ignore stale results (e.g. reconnect while an older open was in flight).
                // Dropping the result tears that session down.
                if token != self.session_token || self.closed {
                    tracing::debug!(token, current = self.session_token, "stale session result");
                    return;
                }
                self.connecting = false;
                match result {
                    Ok((session, page)) => self.install_session(session, page),
                    Err(e) => self.session_failed(e),
                }
            }
            InternalEvent::LiveEvent { token, payload } => {
                if token != self.session_token {
                    return;
                }
                if self.session.is_none() {
                    self.buffered_live.push(payload);
                    return;
                }
                self.apply_live(payload);
            }
            InternalEvent::SubscriptionLost { token, reason } => {
                if token != self.session_token {
                    return;
                }
                tracing::warn!(%reason, "live subscription lost");
                if self.session.is_none() {
                    self.lost_while_connecting = Some(reason);
                    return;
                }
                self.set_status(FeedStatus::SubscriptionLost { reason });
            }
            InternalEvent::OlderHistoryLoaded { token, result } => {
                if token != self.session_token {
                    return;
                }
                self.state.loading_older = false;
                self.dirty = true;
                match result {
                    Ok(page) => {
                        self.merge_history(page.messages);
                        self.state.can_load_older = page.next_cursor.is_some();
                        self.state.cursor = page.next_cursor;
                    }
                    Err(e) => tracing::warn!(err = %e, "loading older history failed"),
                }
            }
            InternalEvent::SendCompleted { client_ref, result } => {
                self.finish_send(&client_ref, result);
            }
        }
    }

    fn open_session(&mut self) {
        if self.closed {
            return;
        }
        if let Some(mut old) = self.session.take() {
            old.shutdown();
        }
        self.session_token += 1;
        self.connecting = true;
        self.buffered_live.clear();
        self.lost_while_connecting = None;
        self.state.loading_older = false;
        self.set_status(if self.initialized {
            FeedStatus::Reconnecting
        } else {
            FeedStatus::Connecting
        });
        self.dirty = true;

        let token = self.session_token;
        let provider = self.provider.clone();
        let identity = self.identity.clone();
        let conversation_id = self.state.conversation_id.clone();
        let sink = LiveSink::new(token, self.core_sender.clone());
        let page_size = self.config.history_page_size();
        let tx = self.core_sender.clone();
        tracing::info!(token, conversation_id = %conversation_id, "opening session");
        self.runtime.spawn(async move {
            let result =
                session::establish(provider, &identity, &conversation_id, sink, page_size).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SessionOpened {
                token,
                result,
            })));
        });
    }

    fn install_session(&mut self, session: FeedSession, page: HistoryPage) {
        self.session = Some(session);
        let first_load = !self.initialized;
        self.merge_history(page.messages);
        if first_load {
            self.state.can_load_older = page.next_cursor.is_some();
            self.state.cursor = page.next_cursor;
        }
        self.initialized = true;
        for payload in std::mem::take(&mut self.buffered_live) {
            self.apply_live(payload);
        }
        match self.lost_while_connecting.take() {
            Some(reason) => self.set_status(FeedStatus::SubscriptionLost { reason }),
            None => self.set_status(FeedStatus::Live),
        }
        self.dirty = true;
    }

    fn session_failed(&mut self, err: SessionError) {
        tracing::error!(err = %err, initialized = self.initialized, "session open failed");
        self.buffered_live.clear();
        self.lost_while_connecting = None;
        let reason = err.to_string();
        if self.initialized {
            self.set_status(FeedStatus::SubscriptionLost { reason });
        } else {
            self.set_status(FeedStatus::Failed { reason });
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session_token += 1;
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        let abandoned = self.coordinator.abandon_all();
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "closing with sends in flight");
        }
    }

    fn merge_history(&mut self, items: Vec<Value>) {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match normalize(RawEvent::HistoryItem(item)) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(err = %e, "dropping malformed history item"),
            }
        }
        let change = self.log.load_history(records);
        self.record_change(change);
    }

    fn apply_live(&mut self, payload: Value) {
        match normalize(RawEvent::LivePush(payload)) {
            Ok(record) => {
                let change = self.log.apply_live_event(record);
                self.record_change(change);
            }
            Err(MalformedEventError::UnsupportedType(kind)) => {
                tracing::debug!(%kind, "ignoring non-message event");
            }
            Err(e) => tracing::warn!(err = %e, "dropping malformed live event"),
        }
    }

    fn submit(&mut self, client_ref: String, text: String) {
        let submission = match self.coordinator.begin(&client_ref, &text) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%client_ref, err = %e, "submit rejected");
                return;
            }
        };
        let record = match normalize(RawEvent::LocalSubmission(submission)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%client_ref, err = %e, "submit rejected");
                self.coordinator.settle(&client_ref);
                return;
            }
        };

        // Visible locally before anything goes over the wire.
        let change = self.log.insert_optimistic(record);
        if change.is_unchanged() {
            self.coordinator.settle(&client_ref);
            return;
        }
        self.record_change(change);

        let Some(handle) = self.session.as_ref().map(FeedSession::handle) else {
            self.finish_send(
                &client_ref,
                Err(SendError::Network("not connected".to_string())),
            );
            return;
        };
        tracing::debug!(%client_ref, in_flight = self.coordinator.in_flight(), "sending");
        let tx = self.core_sender.clone();
        let outgoing = OutgoingMessage {
            client_ref: client_ref.clone(),
            text,
        };
        self.runtime.spawn(async move {
            let result = handle.send(outgoing).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SendCompleted {
                client_ref,
                result,
            })));
        });
    }

    fn finish_send(&mut self, client_ref: &str, result: Result<Value, SendError>) {
        if !self.coordinator.settle(client_ref) {
            tracing::debug!(client_ref, "send result for unknown client_ref");
            return;
        }
        match result {
            Ok(payload) => match normalize(RawEvent::LivePush(payload)) {
                Ok(record) => {
                    let change = self.log.confirm_optimistic(client_ref, record);
                    self.record_change(change);
                }
                // A later echo can still upgrade it.
                Err(e) => {
                    tracing::warn!(client_ref, err = %e, "malformed send response");
                    let change = self.log.fail_optimistic(client_ref, SendFailure::Rejected);
                    self.record_change(change);
                }
            },
            Err(e) => {
                tracing::warn!(client_ref, err = %e, "send failed");
                let change = self.log.fail_optimistic(client_ref, e.failure());
                self.record_change(change);
            }
        }

        let settled = self
            .log
            .entries()
            .iter()
            .rev()
            .find(|m| m.client_ref.as_deref() == Some(client_ref))
            .map(|m| m.state.clone());
        if let Some(state) = settled.filter(|s| !s.is_pending()) {
            self.settled.push((client_ref.to_string(), state));
            self.dirty = true;
        }
    }

    fn load_older(&mut self) {
        if self.state.loading_older || !self.state.can_load_older {
            return;
        }
        let (Some(session), Some(cursor)) = (self.session.as_ref(), self.state.cursor.clone())
        else {
            return;
        };
        let handle = session.handle();
        let token = self.session_token;
        let limit = self.config.history_page_size();
        let tx = self.core_sender.clone();
        self.state.loading_older = true;
        self.dirty = true;
        self.runtime.spawn(async move {
            let result = handle.history(Some(&cursor), limit).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::OlderHistoryLoaded {
                token,
                result,
            })));
        });
    }
}

/// Waits until the feed has loaded its first history page.
pub(crate) fn wait_ready(
    shared_state: &RwLock<ConversationFeed>,
    status_rx: &Receiver<()>,
    timeout: std::time::Duration,
) -> Result<(), FeedError> {
    const POLL_SLICE: std::time::Duration = std::time::Duration::from_millis(50);
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let status = match shared_state.read() {
            Ok(g) => g.status.clone(),
            Err(poison) => poison.into_inner().status.clone(),
        };
        match status {
            s if s.is_ready() => return Ok(()),
            FeedStatus::Failed { reason } => return Err(FeedError::Init(reason)),
            FeedStatus::Closed => return Err(FeedError::Closed),
            _ => {}
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return Err(FeedError::Timeout);
        }
        let _ = status_rx.recv_timeout((deadline - now).min(POLL_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::memory::InMemoryProvider;

    struct Harness {
        core: FeedCore,
        rx: Receiver<CoreMsg>,
        updates: Receiver<FeedUpdate>,
    }

    /// A core with its session installed, driven by hand instead of `run`.
    fn live_core(history: usize) -> Harness {
        let provider = InMemoryProvider::new();
        for i in 0..history {
            provider.post_message("c1", "bob", &format!("h{i}"));
        }
        let (update_tx, updates) = flume::unbounded();
        let (core_tx, rx) = flume::unbounded();
        let (status_tx, _) = flume::bounded(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let mut core = FeedCore::new(
            update_tx,
            core_tx,
            status_tx,
            Arc::new(RwLock::new(ConversationFeed::empty("c1"))),
            runtime,
            FeedConfig::default(),
            FeedTarget {
                identity: "alice".into(),
                conversation_id: "c1".into(),
                provider: Arc::new(provider),
            },
        );

        core.open_session();
        loop {
            let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let opened = matches!(
                &msg,
                CoreMsg::Internal(ev) if matches!(**ev, InternalEvent::SessionOpened { .. })
            );
            core.handle_message(msg);
            if opened {
                break;
            }
        }
        core.flush();
        assert_eq!(core.state.status, FeedStatus::Live);
        assert_eq!(core.log.len(), history);
        let _ = updates.try_iter().count();
        Harness { core, rx, updates }
    }

    fn live(token: u64, i: usize) -> CoreMsg {
        CoreMsg::Internal(Box::new(InternalEvent::LiveEvent {
            token,
            payload: json!({
                "id": format!("l{i}"),
                "user_id": "bob",
                "text": format!("live {i}"),
                "created_at": 1_900_000_000_000i64 + i as i64,
            }),
        }))
    }

    #[test]
    fn queued_messages_publish_one_snapshot_per_tick() {
        let mut h = live_core(2);
        let rev = h.core.state.rev;
        let token = h.core.session_token;
        for i in 0..5 {
            h.core.core_sender.send(live(token, i)).unwrap();
        }

        let first = h.rx.recv().unwrap();
        h.core.tick(first, &h.rx);

        let updates: Vec<FeedUpdate> = h.updates.try_iter().collect();
        assert_eq!(updates.len(), 1);
        let FeedUpdate::FullState(state) = &updates[0] else {
            panic!("expected a full state, got {:?}", updates[0]);
        };
        assert_eq!(state.rev, rev + 1);
        assert_eq!(state.messages.len(), 7);
        assert_eq!(state.messages[6].id, "l4");
        assert!(h.rx.is_empty());
    }

    #[test]
    fn tick_stops_at_the_batch_limit() {
        let mut h = live_core(0);
        let token = h.core.session_token;
        for i in 0..MAX_MESSAGES_PER_TICK + 10 {
            h.core.core_sender.send(live(token, i)).unwrap();
        }

        let first = h.rx.recv().unwrap();
        h.core.tick(first, &h.rx);
        assert_eq!(h.core.log.len(), MAX_MESSAGES_PER_TICK);
        assert_eq!(h.rx.len(), 10);

        let first = h.rx.recv().unwrap();
        h.core.tick(first, &h.rx);
        assert_eq!(h.core.log.len(), MAX_MESSAGES_PER_TICK + 10);
        let full_states = h
            .updates
            .try_iter()
            .filter(|u| matches!(u, FeedUpdate::FullState(_)))
            .count();
        assert_eq!(full_states, 2);
    }

    #[test]
    fn unreadable_send_response_fails_the_entry() {
        let mut h = live_core(0);
        h.core.handle_message(CoreMsg::Action(FeedAction::Submit {
            client_ref: "r1".into(),
            text: "hello".into(),
        }));
        h.core
            .handle_message(CoreMsg::Internal(Box::new(InternalEvent::SendCompleted {
                client_ref: "r1".into(),
                result: Ok(json!({"id": "m-1"})),
            })));
        h.core.flush();

        let entry = h.core.state.message_by_ref("r1").unwrap();
        assert_eq!(
            entry.state,
            MessageState::Failed {
                reason: SendFailure::Rejected
            }
        );
        assert!(h.updates.try_iter().any(|u| matches!(
            u,
            FeedUpdate::SendSettled {
                ref client_ref,
                state: MessageState::Failed { reason: SendFailure::Rejected },
                ..
            } if client_ref == "r1"
        )));

        // The provider's own echo of the send still confirms it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.core.log.failed_count() > 0 {
            assert!(Instant::now() < deadline, "echo never arrived");
            if let Ok(msg) = h.rx.recv_timeout(Duration::from_millis(50)) {
                h.core.handle_message(msg);
            }
        }
        assert_eq!(h.core.log.confirmed_count(), 1);
        assert_eq!(h.core.log.len(), 1);
    }
}
