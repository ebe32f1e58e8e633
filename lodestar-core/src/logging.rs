//! Opt-in log output for applications that do not install their own
//! subscriber.
//!
//! Lodestar emits through `tracing` only. This module reads:
//!
//! - `LODESTAR_DEBUG=true|1|yes` - enable debug logging
//! - `LODESTAR_LOG_LEVEL=trace|debug|info|warn|error` - set the level
//! - `LODESTAR_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! lodestar_core::logging::init();
//! ```
//!
//! Installing a subscriber requires the `tracing-subscriber` feature; without
//! it [`init`] only records that it ran.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "LODESTAR_DEBUG";
const LEVEL_VAR: &str = "LODESTAR_LOG_LEVEL";
const FORMAT_VAR: &str = "LODESTAR_LOG_FORMAT";

/// Whether `LODESTAR_DEBUG` asks for debug output.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Level from `LODESTAR_LOG_LEVEL`, else "debug" when debugging, else "warn".
pub fn log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    env::var(LEVEL_VAR)
        .map(|level| match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        })
        .unwrap_or(fallback)
}

/// Format from `LODESTAR_LOG_FORMAT`.
pub fn log_format() -> &'static str {
    env::var(FORMAT_VAR)
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// Install a global subscriber once, if logging was requested through the
/// environment. Later calls do nothing.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var(LEVEL_VAR).is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = log_level();
            let filter = EnvFilter::try_new(format!(
                "lodestar={},lodestar_core={},lodestar_bson={}",
                level, level, level
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            let registry = tracing_subscriber::registry().with(filter);
            let installed = match log_format() {
                "json" => registry.with(fmt::layer().json()).try_init(),
                "compact" => registry.with(fmt::layer().compact()).try_init(),
                _ => registry.with(fmt::layer().pretty()).try_init(),
            };
            if installed.is_ok() {
                tracing::info!(level, format = log_format(), "lodestar logging initialized");
            }
        }
    });
}

/// Enable debug output and [`init`].
///
/// # Safety
///
/// Sets an environment variable; call before spawning threads.
pub unsafe fn init_debug() {
    // SAFETY: the caller guarantees no other thread touches the environment.
    unsafe {
        env::set_var(DEBUG_VAR, "true");
    }
    init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment() {
        // SAFETY: these variables are only read by this module's tests.
        unsafe {
            env::remove_var(DEBUG_VAR);
            env::remove_var(LEVEL_VAR);
            env::remove_var(FORMAT_VAR);
        }
        assert!(!is_debug_enabled());
        assert_eq!(log_level(), "warn");
        assert_eq!(log_format(), "json");
        init();
    }
}
