//! Tracing initialization for the Pier daemon.
//!
//! The filter sits behind a `reload` layer so the reconciliation loop can
//! change verbosity when `log_level` changes in the settings file. When
//! `RUST_LOG` is set it takes precedence and settings changes are ignored.

use pier_node::{InvalidLevel, LevelControl};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

/// Handle for swapping the active log filter.
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned_by_env: bool,
}

impl LogLevelHandle {
    /// Current filter, rendered as a directive string.
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|filter| filter.to_string()).ok()
    }
}

impl LevelControl for LogLevelHandle {
    fn set_level(&self, level: &str) -> Result<(), InvalidLevel> {
        if self.pinned_by_env {
            return Ok(());
        }
        let filter = EnvFilter::try_new(level).map_err(|_| InvalidLevel(level.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|_| InvalidLevel(level.to_string()))
    }
}

/// Build the reloadable filter layer without installing it.
fn reloadable_filter(
    default_level: &str,
) -> (reload::Layer<EnvFilter, Registry>, LogLevelHandle) {
    let from_env = EnvFilter::try_from_default_env();
    let pinned_by_env = from_env.is_ok();
    let filter = from_env.unwrap_or_else(|_| EnvFilter::new(default_level));
    let (layer, handle) = reload::Layer::new(filter);
    (
        layer,
        LogLevelHandle {
            handle,
            pinned_by_env,
        },
    )
}

/// Install the global subscriber.
///
/// Call once at startup, before any `tracing` events are emitted.
pub fn init(default_level: &str) -> LogLevelHandle {
    let (filter, handle) = reloadable_filter(default_level);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    handle
}
