//! Boundary to the remote message service.
//!
//! A `SessionProvider` yields an identity-bound `FeedHandle` for one
//! conversation. The core never talks to a transport directly; it only sees
//! raw JSON records coming through these traits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flume::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SendError, SessionError};
use crate::updates::{CoreMsg, InternalEvent};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Oldest first.
    pub messages: Vec<Value>,
    /// Pass back to `history` to fetch the page before this one.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub client_ref: String,
    pub text: String,
}

#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    async fn open(
        &self,
        identity: &str,
        conversation_id: &str,
    ) -> Result<Arc<dyn FeedHandle>, SessionError>;
}

#[async_trait]
pub trait FeedHandle: Send + Sync + 'static {
    /// Newest `limit` messages strictly older than `cursor` (or the newest page
    /// when `cursor` is `None`).
    async fn history(&self, cursor: Option<&str>, limit: u32)
        -> Result<HistoryPage, SessionError>;

    fn subscribe(&self, sink: LiveSink) -> Result<SubscriptionId, SessionError>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Resolves with the server's record of the stored message.
    async fn send(&self, message: OutgoingMessage) -> Result<Value, SendError>;

    fn close(&self);
}

/// Where a subscription pushes raw live events. Once detached (or after
/// reporting a lost connection) it silently drops everything.
#[derive(Clone, Debug)]
pub struct LiveSink {
    token: u64,
    attached: Arc<AtomicBool>,
    tx: Sender<CoreMsg>,
}

impl LiveSink {
    pub fn new(token: u64, tx: Sender<CoreMsg>) -> Self {
        Self {
            token,
            attached: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn deliver(&self, payload: Value) -> bool {
        if !self.is_attached() {
            return false;
        }
        self.tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::LiveEvent {
                token: self.token,
                payload,
            })))
            .is_ok()
    }

    /// Reports the subscription as gone. Only the first report goes through.
    pub fn connection_lost(&self, reason: impl Into<String>) -> bool {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::SubscriptionLost {
                token: self.token,
                reason: reason.into(),
            })))
            .is_ok()
    }
}

pub struct LiveSubscription {
    id: SubscriptionId,
    // Shared with the sink; cleared on detach or on a lost connection.
    sink_attached: Arc<AtomicBool>,
    detached: AtomicBool,
    handle: Arc<dyn FeedHandle>,
}

impl LiveSubscription {
    /// Stops forwarding and unsubscribes. A sink that already reported a lost
    /// connection still gets unsubscribed. Safe to call more than once.
    pub fn detach(&self) {
        self.sink_attached.store(false, Ordering::SeqCst);
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.handle.unsubscribe(self.id);
        }
    }
}

/// An open handle plus its live subscription. Dropping it detaches the
/// subscription and closes the handle.
pub struct FeedSession {
    handle: Arc<dyn FeedHandle>,
    subscription: LiveSubscription,
    closed: bool,
}

impl fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSession")
            .field("subscription", &self.subscription.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FeedSession {
    pub fn handle(&self) -> Arc<dyn FeedHandle> {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.subscription.detach();
        self.handle.close();
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens a handle, subscribes, then fetches the newest history page.
///
/// Subscribing first means nothing published between the history read and the
/// subscription is missed; overlap is removed by the log's id union.
pub async fn establish(
    provider: Arc<dyn SessionProvider>,
    identity: &str,
    conversation_id: &str,
    sink: LiveSink,
    page_size: u32,
) -> Result<(FeedSession, HistoryPage), SessionError> {
    let handle = provider.open(identity, conversation_id).await?;
    let attached = sink.attached.clone();
    let id = match handle.subscribe(sink) {
        Ok(id) => id,
        Err(e) => {
            attached.store(false, Ordering::SeqCst);
            handle.close();
            return Err(e);
        }
    };
    let session = FeedSession {
        handle: handle.clone(),
        subscription: LiveSubscription {
            id,
            sink_attached: attached,
            detached: AtomicBool::new(false),
            handle,
        },
        closed: false,
    };
    // An early return drops `session`, which tears it down.
    let page = session.handle.history(None, page_size).await?;
    tracing::debug!(
        conversation_id,
        subscription = id,
        messages = page.messages.len(),
        has_more = page.next_cursor.is_some(),
        "session established"
    );
    Ok((session, page))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::memory::InMemoryProvider;

    /// Records teardown calls and keeps the subscribed sink so the test can
    /// report a lost connection through it.
    #[derive(Default)]
    struct CountingHandle {
        sink: parking_lot::Mutex<Option<LiveSink>>,
        unsubscribes: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl FeedHandle for CountingHandle {
        async fn history(
            &self,
            _cursor: Option<&str>,
            _limit: u32,
        ) -> Result<HistoryPage, SessionError> {
            Ok(HistoryPage::default())
        }

        fn subscribe(&self, sink: LiveSink) -> Result<SubscriptionId, SessionError> {
            *self.sink.lock() = Some(sink);
            Ok(1)
        }

        fn unsubscribe(&self, _id: SubscriptionId) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }

        async fn send(&self, _message: OutgoingMessage) -> Result<Value, SendError> {
            Err(SendError::Network("unused".into()))
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingProvider(Arc<CountingHandle>);

    #[async_trait]
    impl SessionProvider for CountingProvider {
        async fn open(
            &self,
            _identity: &str,
            _conversation_id: &str,
        ) -> Result<Arc<dyn FeedHandle>, SessionError> {
            Ok(self.0.clone())
        }
    }

    fn live_payloads(rx: &flume::Receiver<CoreMsg>) -> Vec<(u64, Value)> {
        rx.try_iter()
            .filter_map(|msg| match msg {
                CoreMsg::Internal(ev) => match *ev {
                    InternalEvent::LiveEvent { token, payload } => Some((token, payload)),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn establish_subscribes_and_loads_history() {
        let provider = InMemoryProvider::new();
        provider.post_message("c1", "bob", "one");
        provider.post_message("c1", "bob", "two");

        let (tx, rx) = flume::unbounded();
        let (session, page) = establish(
            Arc::new(provider.clone()),
            "alice",
            "c1",
            LiveSink::new(7, tx),
            50,
        )
        .await
        .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(provider.active_subscriptions("c1"), 1);

        provider.post_message("c1", "bob", "three");
        let got = live_payloads(&rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 7);
        assert_eq!(got[0].1["message"]["text"], json!("three"));

        drop(session);
        assert_eq!(provider.active_subscriptions("c1"), 0);
        assert_eq!(provider.open_handles(), 0);
    }

    #[tokio::test]
    async fn history_failure_tears_down_subscription_and_handle() {
        let provider = InMemoryProvider::new();
        provider.fail_next_history(SessionError::History("boom".into()));
        let (tx, _rx) = flume::unbounded();
        let err = establish(
            Arc::new(provider.clone()),
            "alice",
            "c1",
            LiveSink::new(1, tx),
            50,
        )
        .await
        .unwrap_err();
        assert_eq!(err, SessionError::History("boom".into()));
        assert_eq!(provider.active_subscriptions("c1"), 0);
        assert_eq!(provider.open_handles(), 0);
        assert_eq!(provider.close_calls(), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_closes_handle() {
        let provider = InMemoryProvider::new();
        provider.fail_next_subscribe(SessionError::Subscribe("denied".into()));
        let (tx, _rx) = flume::unbounded();
        let sink = LiveSink::new(1, tx);
        let err = establish(Arc::new(provider.clone()), "alice", "c1", sink.clone(), 50)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Subscribe("denied".into()));
        assert!(!sink.is_attached());
        assert_eq!(provider.open_handles(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_detached_sink_drops_events() {
        let provider = InMemoryProvider::new();
        let (tx, rx) = flume::unbounded();
        let sink = LiveSink::new(3, tx);
        let (mut session, _) = establish(
            Arc::new(provider.clone()),
            "alice",
            "c1",
            sink.clone(),
            50,
        )
        .await
        .unwrap();

        session.shutdown();
        session.shutdown();
        assert!(session.is_closed());
        drop(session);
        assert_eq!(provider.close_calls(), 1);

        assert!(!sink.deliver(json!({"id": "late"})));
        assert!(!sink.connection_lost("gone"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_unsubscribes_after_connection_lost() {
        let handle = Arc::new(CountingHandle::default());
        let (tx, rx) = flume::unbounded();
        let (mut session, _) = establish(
            Arc::new(CountingProvider(handle.clone())),
            "alice",
            "c1",
            LiveSink::new(4, tx),
            50,
        )
        .await
        .unwrap();

        let sink = handle.sink.lock().clone().unwrap();
        assert!(sink.connection_lost("socket closed"));
        assert_eq!(rx.try_iter().count(), 1);

        session.shutdown();
        drop(session);
        assert_eq!(handle.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
        assert!(!sink.deliver(json!({})));
    }

    #[test]
    fn connection_lost_reports_once() {
        let (tx, rx) = flume::unbounded();
        let sink = LiveSink::new(9, tx);
        assert!(sink.connection_lost("socket closed"));
        assert!(!sink.connection_lost("again"));
        assert!(!sink.deliver(json!({})));
        let msgs: Vec<CoreMsg> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            &msgs[0],
            CoreMsg::Internal(ev) if matches!(**ev, InternalEvent::SubscriptionLost { token: 9, .. })
        ));
    }
}
