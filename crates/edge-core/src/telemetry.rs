use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// setup_logging installs the global tracing subscriber. Call once, from the binary entrypoint,
/// before anything logs. The filter comes from RUST_LOG (default `info`); set LOG_FORMAT=json for
/// machine-readable output.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = std::env::var("LOG_FORMAT")
		.map(|f| f.eq_ignore_ascii_case("json"))
		.unwrap_or(false);
	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().with_writer(std::io::stderr))
			.init();
	}
}

pub mod testing {
	use tracing_subscriber::EnvFilter;

	/// Best-effort subscriber installation for tests; safe to call repeatedly.
	pub fn setup_test_logging() {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_test_writer()
			.try_init();
	}
}
