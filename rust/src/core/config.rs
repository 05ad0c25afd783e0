use std::path::Path;

use serde::{Deserialize, Serialize};

use super::FeedCore;
use crate::message_log::DEFAULT_ECHO_MATCH_WINDOW_MS;
use crate::viewport::{DEFAULT_ESTIMATED_ITEM_HEIGHT, DEFAULT_OVERSCAN};

pub const CONFIG_FILE_NAME: &str = "chatfeed_config.json";

const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;
const MAX_HISTORY_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    pub history_page_size: Option<u32>,
    pub overscan: Option<u32>,
    pub estimated_item_height: Option<f64>,
    pub viewport_height: Option<f64>,
    // 0 turns off matching echoes without client_ref against pending sends.
    pub echo_match_window_ms: Option<i64>,
}

impl FeedConfig {
    pub fn history_page_size(&self) -> u32 {
        self.history_page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
            .min(MAX_HISTORY_PAGE_SIZE)
    }

    pub fn overscan(&self) -> u32 {
        self.overscan.unwrap_or(DEFAULT_OVERSCAN)
    }

    pub fn estimated_item_height(&self) -> f64 {
        self.estimated_item_height
            .filter(|h| h.is_finite() && *h > 0.0)
            .unwrap_or(DEFAULT_ESTIMATED_ITEM_HEIGHT)
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport_height
            .filter(|h| h.is_finite() && *h >= 0.0)
            .unwrap_or(0.0)
    }

    pub fn echo_match_window_ms(&self) -> i64 {
        self.echo_match_window_ms
            .unwrap_or(DEFAULT_ECHO_MATCH_WINDOW_MS)
            .max(0)
    }
}

/// Missing or unparsable file means defaults.
pub fn load_feed_config(data_dir: &str) -> FeedConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return FeedConfig::default();
    };
    match serde_json::from_slice::<FeedConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "ignoring unreadable config");
            FeedConfig::default()
        }
    }
}

pub fn default_config_json() -> String {
    let defaults = FeedConfig {
        history_page_size: Some(DEFAULT_HISTORY_PAGE_SIZE),
        overscan: Some(DEFAULT_OVERSCAN),
        estimated_item_height: Some(DEFAULT_ESTIMATED_ITEM_HEIGHT),
        viewport_height: Some(0.0),
        echo_match_window_ms: Some(DEFAULT_ECHO_MATCH_WINDOW_MS),
    };
    serde_json::to_string_pretty(&defaults).unwrap_or_else(|_| "{}".to_string())
}

impl FeedCore {
    /// `None` when the echo heuristic is off.
    pub(super) fn echo_match_window(&self) -> Option<i64> {
        let from_env = std::env::var("CHATFEED_ECHO_MATCH_WINDOW_MS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok());
        let window = from_env.unwrap_or_else(|| self.config.echo_match_window_ms());
        (window > 0).then_some(window)
    }
}
