//! Injected diagnostics sink.
//!
//! Components never print. They receive a `LogSink` and hand it one finished
//! line at a time; the default sink forwards into `tracing`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Forwards every line to `tracing::info!` under the `hilbus` target.
pub fn tracing_sink() -> LogSink {
    Arc::new(|line: &str| tracing::info!(target: "hilbus", "{}", line))
}

/// Discards everything.
pub fn null_sink() -> LogSink {
    Arc::new(|_: &str| {})
}

/// Installs the fmt subscriber used by the binaries.
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}

/// Wall-clock stamp used on audit lines: seconds since the epoch, millisecond resolution.
pub fn wall_stamp(at: SystemTime) -> String {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => format!("{}.{:03}", d.as_secs(), d.subsec_millis()),
        Err(_) => "0.000".to_string(),
    }
}
