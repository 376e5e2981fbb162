use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Build the filter from `rust_log` when it is set; otherwise `pagegate` at
/// info (debug when verbose) and everything else at warn
fn filter(verbose: bool, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        return EnvFilter::try_new(directives).context(format!("Invalid RUST_LOG: {}", directives));
    }

    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::new("warn").add_directive(format!("pagegate={}", level).parse()?))
}

/// Initialize the logging system.
///
/// Console output always goes to stderr: the worker subcommand owns stdout
/// for protocol frames.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = filter(verbose, rust_log.as_deref())?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {}", parent.display()))?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context(format!("Failed to open log file: {}", log_file.display()))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to install log subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to install log subscriber")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let quiet = filter(false, None).unwrap().to_string();
        assert!(quiet.contains("pagegate=info"));
        assert!(quiet.contains("warn"));

        let verbose = filter(true, Some("  ")).unwrap().to_string();
        assert!(verbose.contains("pagegate=debug"));
    }

    #[test]
    fn test_rust_log_replaces_defaults() {
        let custom = filter(true, Some("pagegate=trace,hyper=error")).unwrap().to_string();
        assert!(custom.contains("pagegate=trace"));
        assert!(custom.contains("hyper=error"));
        assert!(!custom.contains("pagegate=debug"));

        assert!(filter(false, Some("pagegate=loud")).is_err());
    }
}
