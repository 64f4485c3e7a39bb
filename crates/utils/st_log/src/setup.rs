//! Function to set up logging in binaries and test harnesses.

/// Directs [`log`] calls to stderr.
///
/// Idempotent: only the first call has any effect.
pub fn setup_native_logging() {
    fn setup() {
        if cfg!(debug_assertions) && std::env::var("RUST_BACKTRACE").is_err() {
            // In debug builds, default `RUST_BACKTRACE` to `1` if it is not
            // set, so that test failures come with a backtrace.
            #[expect(unsafe_code)]
            // SAFETY: called during single-threaded process setup.
            unsafe {
                std::env::set_var("RUST_BACKTRACE", "1");
            }
        }

        let log_filter = crate::default_log_filter();

        if log_filter.contains("trace") {
            log::set_max_level(log::LevelFilter::Trace);
        } else if log_filter.contains("debug") {
            log::set_max_level(log::LevelFilter::Debug);
        } else {
            log::set_max_level(log::LevelFilter::Info);
        }

        let mut stderr_logger = env_logger::Builder::new();
        stderr_logger.parse_filters(&log_filter);
        stderr_logger.init();
    }

    use std::sync::Once;
    static START: Once = Once::new();
    START.call_once(setup);
}
