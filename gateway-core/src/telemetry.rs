//! Logging bootstrap.
//!
//! A thin wrapper over `tracing-subscriber`; kept separate from the application so tests and
//! alternate binaries (benchmarks, admin tools) can opt in without duplicating the filter logic.

use once_cell::sync::Lazy;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

/// Installs a global tracing subscriber. Call once at process startup; subsequent calls are
/// no-ops (the install failure is swallowed, matching the "idempotent setup" contract the rest
/// of the gateway relies on).
pub fn init(format: LogFormat) {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	let result = match format {
		LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init(),
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json().flatten_event(true))
			.try_init(),
	};
	if let Err(e) = result {
		eprintln!("logging already initialized: {e}");
	}
}
