//! In-process message service used by tests and the `chatfeed` CLI.
//!
//! Messages are stored as the same JSON shape a real service hands out
//! (`id`, `text`, `user`, `created_at`, ...). Live pushes use the
//! `{"type": "message.new", "message": {..}}` envelope.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{SendError, SessionError};
use crate::session::{
    FeedHandle, HistoryPage, LiveSink, OutgoingMessage, SessionProvider, SubscriptionId,
};
use crate::state::now_millis;

const CURSOR_PREFIX: &str = "before:";

struct Subscriber {
    id: SubscriptionId,
    handle_id: u64,
    conversation_id: String,
    sink: LiveSink,
}

#[derive(Default)]
struct ProviderState {
    conversations: HashMap<String, Vec<Value>>,
    subscribers: Vec<Subscriber>,
    open_handles: HashSet<u64>,
    next_handle: u64,
    next_subscription: SubscriptionId,
    next_message: u64,
    last_created_at: i64,
    close_calls: u64,

    fail_next_open: Option<SessionError>,
    fail_next_history: Option<SessionError>,
    fail_next_subscribe: Option<SessionError>,
    fail_next_send: Option<SendError>,
    strip_client_ref: bool,
    send_delay: Option<Duration>,
}

impl ProviderState {
    /// Server clock: wall time, but strictly increasing.
    fn stamp(&mut self) -> i64 {
        let ts = now_millis().max(self.last_created_at + 1);
        self.last_created_at = ts;
        ts
    }

    fn next_message_id(&mut self) -> String {
        self.next_message += 1;
        format!("m-{}", self.next_message)
    }

    fn sinks_for(&self, conversation_id: &str) -> Vec<LiveSink> {
        self.subscribers
            .iter()
            .filter(|s| s.conversation_id == conversation_id)
            .map(|s| s.sink.clone())
            .collect()
    }
}

fn rfc3339_millis(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Default)]
pub struct InMemoryProvider {
    inner: Arc<Mutex<ProviderState>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw records to a conversation without notifying subscribers.
    pub fn seed_history(&self, conversation_id: &str, messages: impl IntoIterator<Item = Value>) {
        let mut st = self.inner.lock();
        st.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .extend(messages);
    }

    /// Stores a message from another participant and pushes it live.
    pub fn post_message(&self, conversation_id: &str, author_id: &str, text: &str) -> Value {
        let (message, sinks) = {
            let mut st = self.inner.lock();
            let created_at = st.stamp();
            let message = json!({
                "id": st.next_message_id(),
                "type": "regular",
                "text": text,
                "user": {"id": author_id, "name": author_id},
                "created_at": rfc3339_millis(created_at),
                "updated_at": rfc3339_millis(created_at),
            });
            st.conversations
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            (message, st.sinks_for(conversation_id))
        };
        broadcast(&sinks, &json!({"type": "message.new", "message": message}));
        message
    }

    /// Replaces the text of a stored message and pushes `message.updated`.
    pub fn edit_message(&self, conversation_id: &str, message_id: &str, text: &str) -> Option<Value> {
        let (message, sinks) = {
            let mut st = self.inner.lock();
            let updated_at = st.stamp();
            let stored = st
                .conversations
                .get_mut(conversation_id)?
                .iter_mut()
                .find(|m| m["id"] == json!(message_id))?;
            stored["text"] = json!(text);
            stored["updated_at"] = json!(rfc3339_millis(updated_at));
            let message = stored.clone();
            (message, st.sinks_for(conversation_id))
        };
        broadcast(&sinks, &json!({"type": "message.updated", "message": message}));
        Some(message)
    }

    /// Pushes an arbitrary payload to subscribers without storing it.
    pub fn push_live(&self, conversation_id: &str, payload: Value) {
        let sinks = self.inner.lock().sinks_for(conversation_id);
        broadcast(&sinks, &payload);
    }

    /// Ends every subscription on the conversation as if the socket died.
    pub fn drop_connection(&self, conversation_id: &str, reason: &str) {
        let dropped: Vec<LiveSink> = {
            let mut st = self.inner.lock();
            let (gone, kept) = std::mem::take(&mut st.subscribers)
                .into_iter()
                .partition::<Vec<_>, _>(|s| s.conversation_id == conversation_id);
            st.subscribers = kept;
            gone.into_iter().map(|s| s.sink).collect()
        };
        for sink in dropped {
            sink.connection_lost(reason);
        }
    }

    pub fn fail_next_open(&self, err: SessionError) {
        self.inner.lock().fail_next_open = Some(err);
    }

    pub fn fail_next_history(&self, err: SessionError) {
        self.inner.lock().fail_next_history = Some(err);
    }

    pub fn fail_next_subscribe(&self, err: SessionError) {
        self.inner.lock().fail_next_subscribe = Some(err);
    }

    pub fn fail_next_send(&self, err: SendError) {
        self.inner.lock().fail_next_send = Some(err);
    }

    /// When false, echoes and send responses omit `client_ref`.
    pub fn set_echo_client_ref(&self, echo: bool) {
        self.inner.lock().strip_client_ref = !echo;
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.inner.lock().send_delay = delay;
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Value> {
        self.inner
            .lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_subscriptions(&self, conversation_id: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.conversation_id == conversation_id)
            .count()
    }

    pub fn open_handles(&self) -> usize {
        self.inner.lock().open_handles.len()
    }

    pub fn close_calls(&self) -> u64 {
        self.inner.lock().close_calls
    }
}

fn broadcast(sinks: &[LiveSink], payload: &Value) {
    for sink in sinks {
        sink.deliver(payload.clone());
    }
}

#[async_trait]
impl SessionProvider for InMemoryProvider {
    async fn open(
        &self,
        identity: &str,
        conversation_id: &str,
    ) -> Result<Arc<dyn FeedHandle>, SessionError> {
        let id = {
            let mut st = self.inner.lock();
            if let Some(err) = st.fail_next_open.take() {
                return Err(err);
            }
            st.next_handle += 1;
            let id = st.next_handle;
            st.open_handles.insert(id);
            id
        };
        tracing::debug!(handle = id, identity, conversation_id, "memory session opened");
        Ok(Arc::new(MemoryHandle {
            id,
            identity: identity.to_string(),
            conversation_id: conversation_id.to_string(),
            state: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryHandle {
    id: u64,
    identity: String,
    conversation_id: String,
    state: Arc<Mutex<ProviderState>>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedHandle for MemoryHandle {
    async fn history(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut st = self.state.lock();
        if let Some(err) = st.fail_next_history.take() {
            return Err(err);
        }
        let all = st
            .conversations
            .get(&self.conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let end = match cursor {
            None => all.len(),
            Some(c) => c
                .strip_prefix(CURSOR_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| SessionError::History(format!("invalid cursor `{c}`")))?
                .min(all.len()),
        };
        let start = end.saturating_sub(limit as usize);
        Ok(HistoryPage {
            messages: all[start..end].to_vec(),
            next_cursor: (start > 0).then(|| format!("{CURSOR_PREFIX}{start}")),
        })
    }

    fn subscribe(&self, sink: LiveSink) -> Result<SubscriptionId, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut st = self.state.lock();
        if let Some(err) = st.fail_next_subscribe.take() {
            return Err(err);
        }
        st.next_subscription += 1;
        let id = st.next_subscription;
        st.subscribers.push(Subscriber {
            id,
            handle_id: self.id,
            conversation_id: self.conversation_id.clone(),
            sink,
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.retain(|s| s.id != id);
    }

    async fn send(&self, message: OutgoingMessage) -> Result<Value, SendError> {
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(SendError::Network("session closed".to_string()));
        }

        let (stored, sinks) = {
            let mut st = self.state.lock();
            if let Some(err) = st.fail_next_send.take() {
                return Err(err);
            }
            let created_at = st.stamp();
            let mut stored = json!({
                "id": st.next_message_id(),
                "type": "regular",
                "text": message.text,
                "user": {"id": self.identity, "name": self.identity},
                "created_at": rfc3339_millis(created_at),
                "updated_at": rfc3339_millis(created_at),
            });
            if !st.strip_client_ref {
                stored["client_ref"] = json!(message.client_ref);
            }
            st.conversations
                .entry(self.conversation_id.clone())
                .or_default()
                .push(stored.clone());
            (stored, st.sinks_for(&self.conversation_id))
        };
        // The echo goes out before the send call returns.
        broadcast(&sinks, &json!({"type": "message.new", "message": stored}));
        Ok(stored)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut st = self.state.lock();
        st.subscribers.retain(|s| s.handle_id != self.id);
        st.open_handles.remove(&self.id);
        st.close_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::{CoreMsg, InternalEvent};

    async fn open(provider: &InMemoryProvider, conv: &str) -> Arc<dyn FeedHandle> {
        provider.open("alice", conv).await.unwrap()
    }

    #[tokio::test]
    async fn history_pages_walk_backwards() {
        let provider = InMemoryProvider::new();
        for i in 0..5 {
            provider.post_message("c1", "bob", &format!("msg {i}"));
        }
        let handle = open(&provider, "c1").await;

        let newest = handle.history(None, 2).await.unwrap();
        assert_eq!(newest.messages.len(), 2);
        assert_eq!(newest.messages[1]["text"], json!("msg 4"));
        assert_eq!(newest.next_cursor.as_deref(), Some("before:3"));

        let older = handle.history(newest.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(older.messages[0]["text"], json!("msg 1"));

        let oldest = handle.history(older.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(oldest.messages.len(), 1);
        assert!(oldest.next_cursor.is_none());

        let err = handle.history(Some("garbage"), 2).await.unwrap_err();
        assert!(matches!(err, SessionError::History(_)));
    }

    #[tokio::test]
    async fn send_echoes_to_subscribers_before_returning() {
        let provider = InMemoryProvider::new();
        let handle = open(&provider, "c1").await;
        let (tx, rx) = flume::unbounded();
        handle.subscribe(LiveSink::new(1, tx)).unwrap();

        let stored = handle
            .send(OutgoingMessage {
                client_ref: "r1".into(),
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(stored["client_ref"], json!("r1"));
        assert_eq!(stored["user"]["id"], json!("alice"));

        let msg = rx.try_recv().unwrap();
        let CoreMsg::Internal(ev) = msg else {
            panic!("expected internal event");
        };
        let InternalEvent::LiveEvent { payload, .. } = *ev else {
            panic!("expected live event");
        };
        assert_eq!(payload["type"], json!("message.new"));
        assert_eq!(payload["message"]["id"], stored["id"]);
    }

    #[tokio::test]
    async fn stripped_client_ref_and_injected_send_failure() {
        let provider = InMemoryProvider::new();
        provider.set_echo_client_ref(false);
        let handle = open(&provider, "c1").await;
        let out = OutgoingMessage {
            client_ref: "r1".into(),
            text: "x".into(),
        };
        let stored = handle.send(out.clone()).await.unwrap();
        assert!(stored.get("client_ref").is_none());

        provider.fail_next_send(SendError::Rejected("slow mode".into()));
        assert_eq!(
            handle.send(out.clone()).await.unwrap_err(),
            SendError::Rejected("slow mode".into())
        );
        assert!(handle.send(out).await.is_ok());
        assert_eq!(provider.messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn close_drops_this_handles_subscriptions_only() {
        let provider = InMemoryProvider::new();
        let a = open(&provider, "c1").await;
        let b = open(&provider, "c1").await;
        let (tx, _rx) = flume::unbounded();
        a.subscribe(LiveSink::new(1, tx.clone())).unwrap();
        b.subscribe(LiveSink::new(2, tx)).unwrap();
        assert_eq!(provider.active_subscriptions("c1"), 2);

        a.close();
        a.close();
        assert_eq!(provider.active_subscriptions("c1"), 1);
        assert_eq!(provider.open_handles(), 1);
        assert_eq!(provider.close_calls(), 1);
        assert_eq!(a.history(None, 10).await.unwrap_err(), SessionError::Closed);
    }

    #[tokio::test]
    async fn drop_connection_reports_loss_and_forgets_subscribers() {
        let provider = InMemoryProvider::new();
        let handle = open(&provider, "c1").await;
        let (tx, rx) = flume::unbounded();
        let sink = LiveSink::new(4, tx);
        handle.subscribe(sink.clone()).unwrap();

        provider.drop_connection("c1", "socket closed");
        assert_eq!(provider.active_subscriptions("c1"), 0);
        assert!(!sink.is_attached());
        let msgs: Vec<CoreMsg> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn edit_pushes_message_updated() {
        let provider = InMemoryProvider::new();
        let posted = provider.post_message("c1", "bob", "typo");
        let handle = open(&provider, "c1").await;
        let (tx, rx) = flume::unbounded();
        handle.subscribe(LiveSink::new(1, tx)).unwrap();

        let id = posted["id"].as_str().unwrap();
        let edited = provider.edit_message("c1", id, "fixed").unwrap();
        assert_eq!(edited["text"], json!("fixed"));
        assert_ne!(edited["updated_at"], posted["updated_at"]);
        assert_eq!(rx.try_iter().count(), 1);
        assert!(provider.edit_message("c1", "missing", "x").is_none());
    }
}
