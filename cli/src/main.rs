mod replay;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "chatfeed")]
#[command(about = "Drive a message feed against the in-memory service")]
struct Cli {
    /// Data directory (config file and log live here)
    #[arg(long, env = "CHATFEED_DATA_DIR", default_value = ".chatfeed")]
    data_dir: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute the visible window for a fixed-height list
    Viewport {
        /// Number of rows in the feed
        #[arg(long)]
        total: u32,

        /// Scroll offset in pixels (omit to pin to the tail)
        #[arg(long)]
        scroll_offset: Option<f64>,

        #[arg(long, default_value_t = 600.0)]
        viewport_height: f64,

        #[arg(long, default_value_t = 56.0)]
        item_height: f64,

        #[arg(long, default_value_t = 8)]
        overscan: u32,
    },

    /// Run a JSON script of feed steps and print the final snapshot
    Replay {
        /// Script file (see `replay::Script`)
        #[arg(long)]
        script: PathBuf,

        /// Per-step wait limit in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,

        /// Print only counts and visible rows instead of the full snapshot
        #[arg(long)]
        summary: bool,
    },

    /// Print the default config file contents
    DefaultConfig,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.cmd {
        Command::Viewport {
            total,
            scroll_offset,
            viewport_height,
            item_height,
            overscan,
        } => cmd_viewport(
            *total,
            *scroll_offset,
            *viewport_height,
            *item_height,
            *overscan,
        ),
        Command::Replay {
            script,
            timeout_ms,
            summary,
        } => cmd_replay(&cli, script, *timeout_ms, *summary),
        Command::DefaultConfig => {
            println!("{}", chatfeed_core::default_config_json());
            Ok(())
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn print(v: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&v).context("json encode")?);
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_viewport(
    total: u32,
    scroll_offset: Option<f64>,
    viewport_height: f64,
    item_height: f64,
    overscan: u32,
) -> anyhow::Result<()> {
    let window = chatfeed_core::visible_window(
        total,
        scroll_offset.unwrap_or(f64::INFINITY),
        viewport_height,
        item_height,
        overscan,
    );
    print(serde_json::to_value(&window)?)
}

fn cmd_replay(cli: &Cli, script: &Path, timeout_ms: u64, summary: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("create data dir {}", cli.data_dir.display()))?;
    let raw = std::fs::read_to_string(script)
        .with_context(|| format!("read script {}", script.display()))?;
    let script: replay::Script =
        serde_json::from_str(&raw).with_context(|| format!("parse script {}", script.display()))?;

    let state = replay::run(
        &cli.data_dir.to_string_lossy(),
        script,
        std::time::Duration::from_millis(timeout_ms),
    )?;

    if summary {
        print(json!({
            "rev": state.rev,
            "status": state.status,
            "confirmed": state.confirmed_count,
            "pending": state.pending_count,
            "failed": state.failed_count,
            "window": state.window,
            "visible": state
                .visible
                .iter()
                .map(|m| json!({"id": m.id, "author": m.author_id, "text": m.text, "state": m.state}))
                .collect::<Vec<_>>(),
        }))
    } else {
        print(serde_json::to_value(&state)?)
    }
}
