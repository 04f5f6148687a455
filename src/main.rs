//! Binary entrypoint. Parses the CLI, loads the YAML config, installs logging, and builds a
//! manually-sized tokio runtime before handing off to `app::Server`. Grounded on the teacher's
//! `crates/agentgateway-app/src/main.rs` (clap-derived args, config loaded before the runtime
//! exists, plain `fn main() -> anyhow::Result<()>` rather than `#[tokio::main]`).

use std::path::PathBuf;

use clap::Parser;
use protogate::app;
use protogate::config::{self, Config};

#[derive(Parser, Debug)]
#[command(about = "Protocol-aware API gateway", long_about = None)]
struct Args {
	/// Path to the gateway's YAML config file.
	#[arg(short, long, value_name = "FILE")]
	config: PathBuf,

	/// Overrides `telemetry.log_format` from the config ("json" or "text").
	#[arg(long, value_name = "FORMAT")]
	log_format: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let contents = std::fs::read_to_string(&args.config).map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {e}", args.config))?;
	let mut config = Config::from_yaml(&contents)?;
	if let Some(format) = args.log_format {
		config.telemetry.log_format = format;
	}

	if std::env::var_os("RUST_LOG").is_none() {
		// SAFETY: single-threaded at this point, before the tokio runtime (and any of its worker
		// threads) has been built.
		unsafe { std::env::set_var("RUST_LOG", &config.telemetry.log_level) };
	}
	gateway_core::telemetry::init(log_format(&config.telemetry.log_format));

	let mut builder = tokio::runtime::Builder::new_multi_thread();
	builder.enable_all();
	if let Some(threads) = config.runtime.worker_threads.as_deref().and_then(config::resolve_worker_threads) {
		builder.worker_threads(threads);
	}
	let runtime = builder.build()?;

	runtime.block_on(async move {
		tracing::info!(config = ?args.config, "starting gateway");
		let server = app::Server::build(config)?;
		server.run().await
	})
}

fn log_format(raw: &str) -> gateway_core::telemetry::LogFormat {
	match raw {
		"json" => gateway_core::telemetry::LogFormat::Json,
		_ => gateway_core::telemetry::LogFormat::Plain,
	}
}
