use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use chatfeed_core::memory::InMemoryProvider;
use chatfeed_core::{ConversationFeed, FeedAction, FeedApp, SendError, SessionProvider};
use serde::Deserialize;
use serde_json::Value;

/// A replay script:
///
/// ```json
/// {
///   "identity": "alice",
///   "conversation": "general",
///   "history": [{"id": "h1", "text": "hi", "user": {"id": "bob"}, "created_at": 1700000000}],
///   "steps": [
///     {"step": "post", "author": "bob", "text": "hello"},
///     {"step": "send", "text": "hey bob"},
///     {"step": "fail_next_send", "reason": "offline"},
///     {"step": "send", "text": "lost"}
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub identity: String,
    pub conversation: String,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Submit a message as the script identity and wait for it to settle.
    Send { text: String },
    /// Another participant posts a message.
    Post { author: String, text: String },
    Edit { id: String, text: String },
    /// Push a raw payload to live subscribers (not stored).
    Live { payload: Value },
    FailNextSend {
        reason: String,
        #[serde(default)]
        rejected: bool,
    },
    EchoClientRef { enabled: bool },
    DropConnection { reason: String },
    Reconnect,
    LoadOlder,
    Viewport {
        #[serde(default)]
        scroll_offset: Option<f64>,
        viewport_height: f64,
    },
    WaitMs { ms: u64 },
}

fn wait_until(
    app: &FeedApp,
    what: &str,
    timeout: Duration,
    mut f: impl FnMut(&ConversationFeed) -> bool,
) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
        if f(&app.state()) {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what}: timed out after {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn run(data_dir: &str, script: Script, timeout: Duration) -> anyhow::Result<ConversationFeed> {
    let provider = InMemoryProvider::new();
    provider.seed_history(&script.conversation, script.history);

    let app = FeedApp::new(
        data_dir.to_string(),
        script.identity.clone(),
        script.conversation.clone(),
        Arc::new(provider.clone()) as Arc<dyn SessionProvider>,
    )?;
    app.wait_ready(timeout)?;

    for (i, step) in script.steps.into_iter().enumerate() {
        tracing::debug!(step = i, ?step, "replay");
        match step {
            Step::Send { text } => {
                let client_ref = app.submit(text)?;
                wait_until(&app, "send settled", timeout, |s| {
                    s.message_by_ref(&client_ref)
                        .is_some_and(|m| !m.state.is_pending())
                })?;
            }
            Step::Post { author, text } => {
                let posted = provider.post_message(&script.conversation, &author, &text);
                let id = posted["id"].as_str().unwrap_or_default().to_string();
                wait_until(&app, "post delivered", timeout, |s| {
                    s.messages.iter().any(|m| m.id == id)
                })?;
            }
            Step::Edit { id, text } => {
                provider
                    .edit_message(&script.conversation, &id, &text)
                    .ok_or_else(|| anyhow!("step {i}: no message with id {id}"))?;
                wait_until(&app, "edit delivered", timeout, |s| {
                    s.messages.iter().any(|m| m.id == id && m.text == text)
                })?;
            }
            Step::Live { payload } => provider.push_live(&script.conversation, payload),
            Step::FailNextSend { reason, rejected } => {
                provider.fail_next_send(if rejected {
                    SendError::Rejected(reason)
                } else {
                    SendError::Network(reason)
                });
            }
            Step::EchoClientRef { enabled } => provider.set_echo_client_ref(enabled),
            Step::DropConnection { reason } => {
                provider.drop_connection(&script.conversation, &reason);
                wait_until(&app, "subscription lost", timeout, |s| {
                    matches!(s.status, chatfeed_core::FeedStatus::SubscriptionLost { .. })
                })?;
            }
            Step::Reconnect => {
                app.dispatch(FeedAction::Reconnect);
                wait_until(&app, "reconnected", timeout, |s| {
                    s.status == chatfeed_core::FeedStatus::Live
                })?;
            }
            Step::LoadOlder => {
                let before = app.state().messages.len();
                if !app.state().can_load_older {
                    tracing::warn!(step = i, "nothing older to load");
                    continue;
                }
                app.dispatch(FeedAction::LoadOlder);
                wait_until(&app, "older history", timeout, |s| {
                    !s.loading_older && s.messages.len() > before
                })?;
            }
            Step::Viewport {
                scroll_offset,
                viewport_height,
            } => {
                let before = app.state().rev;
                app.dispatch(FeedAction::SetViewport {
                    scroll_offset,
                    viewport_height,
                });
                wait_until(&app, "viewport applied", timeout, |s| s.rev > before)?;
            }
            Step::WaitMs { ms } => std::thread::sleep(Duration::from_millis(ms)),
        }
    }

    Ok(app.state())
}
