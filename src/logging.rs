/// Structured logging setup on top of `tracing-subscriber`
use crate::config::LoggingConfig;
use crate::{ResilienceError, ResilienceResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. When a log directory is
/// configured a daily rolling file layer is added; keep the returned guard alive
/// for the lifetime of the process so buffered lines are flushed.
///
/// Calling this more than once is a no-op that returns `Ok(None)`.
pub fn init_logging(config: &LoggingConfig) -> ResilienceResult<Option<WorkerGuard>> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ResilienceError::Config(format!("invalid log level: {}", e)))?;

    let console = if config.json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, "resilience.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        // Someone else (a test harness, the host) already owns the global subscriber
        tracing::debug!(error = %e, "Global subscriber already installed");
        return Ok(None);
    }

    tracing::debug!(level = %config.level, json = config.json, "Logging initialised");

    Ok(guard)
}
