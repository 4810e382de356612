#![forbid(unsafe_code)]

use std::sync::OnceLock;

static LOG_INIT: OnceLock<()> = OnceLock::new();

/// Opt-in test logging: set `STORM_TEST_LOG=1` (and optionally `RUST_LOG`).
pub(crate) fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("STORM_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}
