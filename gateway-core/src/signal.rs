//! OS signal handling for graceful shutdown.

use tokio::sync::mpsc;

/// Listens for SIGTERM/SIGINT (or Ctrl+C on non-Unix) and resolves `wait()` on the first one. A
/// second Ctrl+C while a graceful shutdown is already underway forces an immediate exit, so an
/// operator is never stuck waiting on a stuck drain.
pub struct Shutdown {
	trigger: ShutdownTrigger,
	rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub fn shutdown_now(&self) {
		let _ = self.tx.try_send(());
	}
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Self {
			trigger: ShutdownTrigger { tx },
			rx,
		}
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		self.trigger.clone()
	}

	/// Waits for a termination signal, spawning the platform listener the first time it's
	/// polled.
	pub async fn wait(mut self) {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{SignalKind, signal};
			let tx = self.trigger.tx.clone();
			tokio::spawn(async move {
				let mut sigterm =
					signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
				let mut sigint =
					signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
				tokio::select! {
					_ = sigterm.recv() => tracing::info!("received SIGTERM"),
					_ = sigint.recv() => tracing::info!("received SIGINT"),
				}
				let _ = tx.try_send(());
			});
		}
		#[cfg(not(unix))]
		{
			let tx = self.trigger.tx.clone();
			tokio::spawn(async move {
				let _ = tokio::signal::ctrl_c().await;
				tracing::info!("received ctrl-c");
				let _ = tx.try_send(());
			});
		}

		self.rx.recv().await;

		// A second Ctrl+C while we are draining forces an immediate exit rather than hanging
		// until the drain deadline.
		tokio::spawn(async move {
			let _ = tokio::signal::ctrl_c().await;
			tracing::warn!("received second shutdown signal, exiting immediately");
			std::process::exit(130);
		});
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}
