#[derive(uniffi::Enum, Debug, Clone, PartialEq)]
pub enum FeedAction {
    // Sending
    Submit {
        client_ref: String,
        text: String,
    },

    // History
    LoadOlder,

    // Viewport
    /// `scroll_offset: None` keeps the window pinned to the tail.
    SetViewport {
        scroll_offset: Option<f64>,
        viewport_height: f64,
    },
    MeasureItem {
        index: u32,
        height: f64,
    },

    // Lifecycle
    Reconnect,
    Close,
}

impl FeedAction {
    /// Log-safe action tag (never includes message text).
    pub fn tag(&self) -> &'static str {
        match self {
            FeedAction::Submit { .. } => "Submit",
            FeedAction::LoadOlder => "LoadOlder",
            FeedAction::SetViewport { .. } => "SetViewport",
            FeedAction::MeasureItem { .. } => "MeasureItem",
            FeedAction::Reconnect => "Reconnect",
            FeedAction::Close => "Close",
        }
    }
}
