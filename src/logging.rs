//! Subscriber setup for applications embedding the primitives
//!
//! The library only emits `tracing` events; [`init_logging`] is optional.

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;
use crate::error::{ResilienceError, Result};

/// Level actually used once `verbose` is taken into account
pub fn effective_level(settings: &LoggingSettings) -> Level {
    if settings.verbose {
        Level::DEBUG
    } else {
        settings.level.to_tracing_level()
    }
}

/// Install a global subscriber: compact lines on stdout, or JSON when a file is set
///
/// `RUST_LOG` takes precedence over the configured level. Fails with
/// [`ResilienceError::Config`] if a global subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("bulwark={}", effective_level(settings))))
        .map_err(|e| ResilienceError::Config(format!("invalid log filter: {}", e)))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.file.as_deref() {
        Some(path) => registry.with(json_layer(path)?).try_init(),
        None => registry.with(fmt::layer().compact()).try_init(),
    };
    installed.map_err(|e| ResilienceError::Config(format!("subscriber already set: {}", e)))
}

fn json_layer<S>(path: &Path) -> Result<impl tracing_subscriber::Layer<S>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let file = File::create(path).map_err(|e| {
        ResilienceError::Config(format!("cannot create log file {}: {}", path.display(), e))
    })?;
    Ok(fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .json())
}
