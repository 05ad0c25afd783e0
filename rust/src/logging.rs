/// Logging initialization.
///
/// - stderr via `tracing-subscriber::fmt`, filtered by `RUST_LOG`
///   (default `chatfeed_core=debug,info`)
/// - a best-effort file copy at `<data_dir>/chatfeed.log` so logs can be
///   pulled from a device or simulator
///
/// Called once at the start of `FeedApp::new()`. Later calls are no-ops.
pub fn init_logging(data_dir: &str) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chatfeed_core=debug,info".into());

    let file_layer = if data_dir.is_empty() {
        None
    } else {
        let log_path = std::path::Path::new(data_dir).join("chatfeed.log");
        let _ = std::fs::create_dir_all(data_dir);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok()
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
            })
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}
