//! Connection draining for graceful shutdown.
//!
//! A `DrainTrigger` initiates a drain; every `DrainWatcher` clone alive at that point (including
//! ones threaded through `wrap_connection`) keeps the trigger's wait alive until dropped. Adapted
//! from the drain primitive used by Istio's ztunnel / agentgateway data plane.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::sync::{mpsc, watch};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainMode {
	/// Cut connections immediately instead of waiting for watchers to drop.
	Immediate,
	/// Wait for every outstanding `DrainWatcher` to drop. The caller is responsible for racing
	/// this against its own deadline.
	Graceful,
}

/// Returns a `(trigger, watcher)` pair.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(());
	let (done_tx, done_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger {
			signal_tx,
			done_rx,
		},
		DrainWatcher {
			signal_rx,
			_done_tx: done_tx,
		},
	)
}

pub struct DrainTrigger {
	signal_tx: watch::Sender<()>,
	done_rx: mpsc::Receiver<()>,
}

impl DrainTrigger {
	/// Begin draining: existing `DrainWatcher`s observe the signal at their next checkpoint.
	/// Resolves once every watcher clone has been dropped, or immediately for `Immediate` mode.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(());
		if mode == DrainMode::Immediate {
			return;
		}
		// recv() returns None once every clone of `_done_tx` has been dropped.
		while self.done_rx.recv().await.is_some() {}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<()>,
	_done_tx: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Await the drain signal. Resolves once `start_drain_and_wait` has been called.
	pub async fn signaled(&mut self) {
		let _ = self.signal_rx.changed().await;
	}

	/// Wrap a long-lived connection future so it keeps this watcher (and therefore the drain
	/// trigger's wait) alive while polling.
	pub fn wrap_connection<F: Future>(self, inner: F) -> DrainedConnection<F> {
		DrainedConnection {
			inner,
			_watcher: self,
		}
	}
}

pin_project! {
	pub struct DrainedConnection<F> {
		#[pin]
		inner: F,
		_watcher: DrainWatcher,
	}
}

impl<F: Future> Future for DrainedConnection<F> {
	type Output = F::Output;
	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		self.project().inner.poll(cx)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_watchers() {
		let (trigger, watcher) = new();
		let counter = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let w = watcher.clone();
			let counter = counter.clone();
			let conn = w.wrap_connection(async move {
				tokio::time::sleep(std::time::Duration::from_millis(10)).await;
				counter.fetch_add(1, Ordering::SeqCst);
			});
			tokio::spawn(conn);
		}
		drop(watcher);
		trigger.start_drain_and_wait(DrainMode::Graceful).await;
		assert_eq!(counter.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn immediate_mode_does_not_wait() {
		let (trigger, watcher) = new();
		let _hold = watcher.clone();
		tokio::time::timeout(
			std::time::Duration::from_millis(50),
			trigger.start_drain_and_wait(DrainMode::Immediate),
		)
		.await
		.expect("immediate drain should not block on watchers");
	}
}
