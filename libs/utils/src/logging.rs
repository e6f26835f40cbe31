//! Tracing subscriber setup shared by the binaries.

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use LogFormat::*;
        match s {
            "plain" => Ok(Plain),
            "json" => Ok(Json),
            _ => anyhow::bail!("Unknown log format: '{s}'. Expected one of the two: 'plain' or 'json'"),
        }
    }
}

/// Initialize logging to stderr, with the given verbosity taken from
/// `RUST_LOG`, defaulting to `info`.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let default_filter_str = "info";

    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Json => base_logger.json().try_init(),
        LogFormat::Plain => base_logger.try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
    .context("failed to initialize tracing subscriber")?;

    Ok(())
}
