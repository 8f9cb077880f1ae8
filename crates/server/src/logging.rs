use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

/// Keeps the non-blocking writer alive; drop it last so buffered lines flush.
pub struct LoggingHandle {
    pub run_id: String,
    _guard: WorkerGuard,
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let filter = std::env::var("TASKROOM_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let to_stderr = std::env::var("TASKROOM_LOG_STDERR").as_deref() == Ok("1");
    let log_dir = paths::log_dir();
    let (writer, guard) = if to_stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        std::fs::create_dir_all(&log_dir)?;
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "server.log"))
    };
    let format = std::env::var("TASKROOM_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(to_stderr)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let destination = if to_stderr {
        "stderr".to_string()
    } else {
        log_dir.join("server.log").display().to_string()
    };
    let run_id = std::env::var("TASKROOM_RUN_ID")
        .unwrap_or_else(|_| format!("pid-{}-{}", std::process::id(), crate::clock::now_millis()));

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        destination = %destination,
        format = %format,
        filter = %std::env::var("TASKROOM_LOG_FILTER")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
    );

    Ok(LoggingHandle {
        run_id,
        _guard: guard,
    })
}
