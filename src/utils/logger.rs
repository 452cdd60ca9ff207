/// Logging configuration and initialization.
use crate::core::config::Config;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// In development mode (debug builds), logs are written to both console and
/// file. In production mode (release builds), logs are written to file only.
///
/// Returns the non-blocking writer guard — callers must hold onto it for
/// the lifetime of the process, or buffered log lines are dropped on exit.
pub fn init_logger(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "signage-cache.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    #[cfg(debug_assertions)]
    let default_level = "debug";
    #[cfg(not(debug_assertions))]
    let default_level = "info";

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
            .init();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
            .init();
    }

    tracing::info!(log_dir = %config.log_dir.display(), "logger initialized");
    Ok(guard)
}
