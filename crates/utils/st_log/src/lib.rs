//! Text logging for use in the statetrace crates.
//!
//! * `trace`: spammy things
//! * `debug`: things that might be useful when debugging
//! * `info`: things that we want to show to users
//! * `warn`: problems that we can recover from
//! * `error`: problems that lead to loss of functionality or data
//!
//! The history stores log with structured key-value fields, which is why we
//! re-export the `tracing` macros rather than the `log` ones.

pub use tracing::{debug, error, info, trace, warn};

pub use log::{Level, LevelFilter};

#[cfg(feature = "setup")]
mod setup;

#[cfg(feature = "setup")]
pub use setup::setup_native_logging;

/// The filter to use if the `RUST_LOG` environment variable is not set.
pub fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned())
}

/// Set `RUST_LOG` to a default if the user hasn't set it themselves,
/// so that our dependencies don't spam the log output.
pub fn set_default_rust_log_env() {
    const RUST_LOG: &str = "RUST_LOG";
    if std::env::var(RUST_LOG).is_err() {
        #[expect(unsafe_code)]
        // SAFETY: called during single-threaded process setup, before any
        // threads that could read the environment are spawned.
        unsafe {
            std::env::set_var(RUST_LOG, "debug");
        }
    }
}
