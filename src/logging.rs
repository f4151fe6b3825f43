// Logging setup
//
// Precedence: RUST_LOG env var > PODCHILL_LOG_OUTPUT/config > default "info".
// In-cluster deployments usually log to stdout and let the node runtime
// collect it; `log_output` pointing at a path switches to a daily-rotated
// file so the proxy can run outside a collector.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Guard that must stay alive for the duration of the process when file
/// logging is active; dropping it flushes the appender.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing with conditional output
pub fn init(config: &Config) -> Result<LogGuard> {
    let default_filter = "podchill=info,tower_http=warn,kube=warn";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.log_output == "stdout" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(LogGuard { _file_guard: None });
    }

    // File output: log_output is a path; rotate daily in its parent dir
    let path = std::path::Path::new(&config.log_output);
    let dir = path.parent().unwrap_or(std::path::Path::new("."));
    let file = path
        .file_name()
        .context("log_output path has no file name")?;

    let appender = tracing_appender::rolling::daily(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();

    Ok(LogGuard {
        _file_guard: Some(guard),
    })
}
