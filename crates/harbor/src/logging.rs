use anyhow::{Context, Result};
use harbor_core::config::{LogFormat, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

const AUDIT_TARGET_OFF: &str = "harbor_core::audit=off";

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.audit_enabled {
        return Ok(filter);
    }
    let directive: Directive = AUDIT_TARGET_OFF
        .parse()
        .context("Invalid audit filter directive")?;
    Ok(filter.add_directive(directive))
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level. With a log file, output goes
/// through a daily-rolling non-blocking writer whose guard must be held
/// until exit. Audit records are dropped when `audit_enabled` is off.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;

    let Some(log_file) = &config.file else {
        match config.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file {} has no file name", log_file.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init(),
    }

    Ok(Some(guard))
}

/// Plain stderr logging for one-shot commands
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
