//! Provides helper functions for initializing logging.
use anyhow::Result;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer, Registry};

/// Format of the emitted log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Compact human readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Initialize logging.
///
/// The level defaults to INFO (DEBUG when `debug` is set) and can be
/// overridden through the `RUST_LOG` environment variable.
pub fn init(debug: bool, format: Format) -> Result<()> {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let log_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()?;

    let logger: Box<dyn Layer<Registry> + Send + Sync> = match format {
        Format::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter)
            .boxed(),
        Format::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(log_filter)
            .boxed(),
    };

    let collector = Registry::default().with(logger);
    tracing::subscriber::set_global_default(collector)?;

    Ok(())
}
