//! Logging configuration with journald support on Linux.
//!
//! Tracing output goes to systemd's journal when it is reachable, otherwise to
//! a daily-rolling file in the data directory.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `BIJUTSU_LOG=debug`.
pub const LOG_ENV: &str = "BIJUTSU_LOG";

/// Initialize the logging system. Call once at startup.
///
/// Log level can be controlled via the `BIJUTSU_LOG` environment variable:
/// - `BIJUTSU_LOG=debug` also logs resolutions that changed nothing
/// - `BIJUTSU_LOG=info` for standard output (default)
/// - `BIJUTSU_LOG=bijutsu::family=debug,warn` for per-module filters
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("bijutsu".to_string()))
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "bijutsu.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread, so it lives for the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bijutsu")
        .join("logs")
}
