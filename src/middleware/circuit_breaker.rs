//! Circuit breaker (spec §4.6): a classic three-state machine (closed, open, half-open) per
//! service+instance key, with configurable thresholds. State transitions are serialized under a
//! per-key mutex; failure/success counts are tracked alongside the state (spec §5: "per-key
//! atomic counters, state transitions under a per-key mutex" — kept together here behind one
//! `parking_lot::Mutex`-guarded map since the counters only ever matter together with the state).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Closed,
	Open,
	HalfOpen,
}

struct KeyState {
	state: State,
	consecutive_failures: u32,
	opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: u32,
	pub open_duration: Duration,
	/// Number of trial successes required in `HalfOpen` before closing again.
	pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			open_duration: Duration::from_secs(30),
			half_open_success_threshold: 1,
		}
	}
}

struct Inner {
	config: CircuitBreakerConfig,
	keys: Mutex<HashMap<String, KeyState>>,
}

impl Inner {
	fn allow(&self, key: &str) -> bool {
		let mut keys = self.keys.lock();
		let entry = keys.entry(key.to_string()).or_insert(KeyState {
			state: State::Closed,
			consecutive_failures: 0,
			opened_at: None,
		});
		match entry.state {
			State::Closed => true,
			State::Open => {
				let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
				if elapsed >= self.config.open_duration {
					entry.state = State::HalfOpen;
					entry.consecutive_failures = 0;
					true
				} else {
					false
				}
			},
			State::HalfOpen => true,
		}
	}

	fn record(&self, key: &str, success: bool) {
		let mut keys = self.keys.lock();
		let Some(entry) = keys.get_mut(key) else { return };
		match entry.state {
			State::Closed => {
				if success {
					entry.consecutive_failures = 0;
				} else {
					entry.consecutive_failures += 1;
					if entry.consecutive_failures >= self.config.failure_threshold {
						entry.state = State::Open;
						entry.opened_at = Some(Instant::now());
						tracing::info!(key, "circuit breaker opened");
					}
				}
			},
			State::HalfOpen => {
				if success {
					entry.consecutive_failures += 1;
					if entry.consecutive_failures >= self.config.half_open_success_threshold {
						entry.state = State::Closed;
						entry.consecutive_failures = 0;
						tracing::info!(key, "circuit breaker closed");
					}
				} else {
					entry.state = State::Open;
					entry.opened_at = Some(Instant::now());
					entry.consecutive_failures = 0;
					tracing::info!(key, "circuit breaker re-opened from half-open");
				}
			},
			State::Open => {},
		}
	}
}

pub struct CircuitBreaker {
	inner: Arc<Inner>,
	/// Key extraction binds service+instance once routing has happened; this layer runs before
	/// routing in the declared composition order (spec §4.6), so the key comes from whatever the
	/// routing layer has already memoized into the request's extensions by the time this layer's
	/// *retry loop* re-enters it (see `middleware::retry`, which wraps this layer on the inside
	/// of routing per spec: "Retry wraps the breaker so retries consult circuit state").
	key_fn: Arc<dyn Fn(&Request) -> String + Send + Sync>,
}

impl CircuitBreaker {
	pub fn new(config: CircuitBreakerConfig, key_fn: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
		Self {
			inner: Arc::new(Inner { config, keys: Mutex::new(HashMap::new()) }),
			key_fn: Arc::new(key_fn),
		}
	}
}

impl Middleware for CircuitBreaker {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let key = (self.key_fn)(&req);
		let inner = self.inner.clone();
		Box::pin(async move {
			if !inner.allow(&key) {
				return Err(GatewayError::unavailable(format!("circuit open for '{key}'")));
			}
			let result = next(req).await;
			inner.record(&key, result.is_ok());
			result
		})
	}
}
