mod actions;
mod core;
mod error;
mod logging;
pub mod memory;
pub mod message_log;
pub mod normalize;
pub mod session;
mod state;
mod updates;
pub mod viewport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};

pub use crate::core::{ClientRefGenerator, FeedConfig, CONFIG_FILE_NAME};
pub use actions::FeedAction;
pub use error::*;
pub use session::{FeedHandle, HistoryPage, LiveSink, OutgoingMessage, SessionProvider};
pub use state::*;
pub use updates::*;
pub use viewport::VisibleWindow;

/// Return the default `chatfeed_config.json` payload used when no config file exists.
pub fn default_config_json() -> String {
    crate::core::default_config_json()
}

pub fn load_feed_config(data_dir: &str) -> FeedConfig {
    crate::core::load_feed_config(data_dir)
}

/// Fixed-height visible window; see `viewport::compute_visible`.
#[uniffi::export]
pub fn visible_window(
    total_count: u32,
    scroll_offset: f64,
    viewport_height: f64,
    estimated_item_height: f64,
    overscan: u32,
) -> VisibleWindow {
    viewport::compute_visible(
        total_count,
        scroll_offset,
        viewport_height,
        estimated_item_height,
        overscan,
    )
}

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait FeedReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: FeedUpdate);
}

#[derive(uniffi::Object)]
pub struct FeedApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<FeedUpdate>,
    status_rx: Receiver<()>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<ConversationFeed>>,
    refs: ClientRefGenerator,
}

impl FeedApp {
    /// Starts the feed actor for one conversation. The session is opened in the
    /// background; use `wait_ready` or watch `state().status`.
    pub fn new(
        data_dir: String,
        identity: String,
        conversation_id: String,
        provider: Arc<dyn SessionProvider>,
    ) -> Result<Arc<Self>, FeedError> {
        logging::init_logging(&data_dir);
        tracing::info!(
            data_dir = %data_dir,
            identity = %identity,
            conversation_id = %conversation_id,
            "FeedApp::new() starting"
        );

        let config = crate::core::load_feed_config(&data_dir);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("chatfeed-io")
            .enable_time()
            .build()
            .map_err(|e| FeedError::Runtime(e.to_string()))?;

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let (status_tx, status_rx) = flume::bounded(1);
        let shared_state = Arc::new(RwLock::new(ConversationFeed::empty(
            conversation_id.clone(),
        )));

        // Actor loop thread (single threaded "feed actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::Builder::new()
            .name("chatfeed-core".to_string())
            .spawn(move || {
                let core = crate::core::FeedCore::new(
                    update_tx,
                    core_tx_for_core,
                    status_tx,
                    shared_for_core,
                    runtime,
                    config,
                    crate::core::FeedTarget {
                        identity,
                        conversation_id,
                        provider,
                    },
                );
                core.run(core_rx);
            })
            .map_err(|e| FeedError::Runtime(e.to_string()))?;

        Ok(Arc::new(Self {
            core_tx,
            update_rx,
            status_rx,
            listening: AtomicBool::new(false),
            shared_state,
            refs: ClientRefGenerator::default(),
        }))
    }

    /// Queues a message for sending and returns its client_ref. Never blocks;
    /// the pending entry shows up in the next published snapshot.
    pub fn submit(&self, text: impl Into<String>) -> Result<String, FeedError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(FeedError::EmptyMessage);
        }
        let client_ref = self.refs.next_ref();
        self.core_tx
            .send(CoreMsg::Action(FeedAction::Submit {
                client_ref: client_ref.clone(),
                text,
            }))
            .map_err(|_| FeedError::Closed)?;
        Ok(client_ref)
    }

    /// Blocks until the first history page is merged, the session fails, or
    /// `timeout` passes.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), FeedError> {
        crate::core::wait_ready(&self.shared_state, &self.status_rx, timeout)
    }
}

#[uniffi::export]
impl FeedApp {
    pub fn state(&self) -> ConversationFeed {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: FeedAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn FeedReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split updates.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl Drop for FeedApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Action(FeedAction::Close));
    }
}
