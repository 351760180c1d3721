use std::sync::OnceLock;

use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

static RELOAD: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the global tracing subscriber. The filter sits behind a reload
/// handle so the `loglevel=` control command can adjust it at runtime.
pub fn init(level: &str, json_format: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry.with(fmt::layer().compact().with_target(true)).try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    let _ = RELOAD.set(handle);
    Ok(())
}

/// Apply a syslog-style severity from the `loglevel=<n>` control command.
pub fn set_level(level: u8) {
    let directive = match level {
        0..=3 => "error",
        4 => "warn",
        5 => "info",
        6 => "debug",
        _ => "trace",
    };
    match RELOAD.get() {
        Some(handle) => {
            if let Err(e) = handle.reload(EnvFilter::new(directive)) {
                warn!("failed to set log level {}: {}", level, e);
            }
        }
        None => warn!("log level {} requested before logging was initialized", level),
    }
}
