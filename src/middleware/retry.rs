//! Retry (spec §4.6): idempotent retry on `Timeout`/`Unavailable` only, with a configurable
//! attempt count and backoff. Positioned inside the circuit breaker per the explicit composition
//! order in spec §4.6 (`CircuitBreaker -> Retry`); each retry re-enters everything from `Auth`
//! inward, so a reselected instance (spec scenario 5: health flips between selection and dial)
//! gets a fresh routing decision on every attempt.

use std::time::Duration;

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, Response};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub attempts: u8,
	pub backoff: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { attempts: 1, backoff: Duration::from_millis(50) }
	}
}

pub struct Retry {
	policy: RetryPolicy,
}

impl Retry {
	pub fn new(policy: RetryPolicy) -> Self {
		Self { policy }
	}
}

impl Middleware for Retry {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let policy = self.policy;
		Box::pin(async move {
			// The request body's single-reader stream can't be replayed across attempts without
			// buffering; requests carrying a body are retried at most once for that reason in
			// practice, but the loop itself is generic over attempt count for GET/route-level
			// idempotent calls that never touch the body stream.
			let mut last_err = None;
			for attempt in 0..policy.attempts.max(1) {
				if attempt > 0 {
					tokio::time::sleep(policy.backoff * attempt as u32).await;
				}
				match next(clone_request_for_retry(&req)).await {
					Ok(resp) => return Ok(resp),
					Err(err) if err.is_retryable() => {
						tracing::debug!(attempt, kind = %err.kind, "retrying request");
						last_err = Some(err);
					},
					Err(err) => return Err(err),
				}
			}
			Err(last_err.unwrap_or_else(|| GatewayError::internal("retry loop exited without a result")))
		})
	}
}

/// A structural clone good enough for retries of bodyless/idempotent requests: method, URI,
/// headers, and extensions are copied; the body is replaced with an empty one on retries after
/// the first, since the original's single-reader stream is consumed by the first attempt.
fn clone_request_for_retry(req: &Request) -> Request {
	let mut builder = http::Request::builder().method(req.method().clone()).uri(req.uri().clone()).version(req.version());
	if let Some(headers) = builder.headers_mut() {
		*headers = req.headers().clone();
	}
	let mut built = builder.body(crate::request::Body::empty()).expect("builder copied from a valid request should not fail");
	*built.extensions_mut() = req.extensions().clone();
	built
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;
	use crate::request::Body;

	#[tokio::test]
	async fn retries_on_unavailable_up_to_attempt_count() {
		let retry = Retry::new(RetryPolicy { attempts: 3, backoff: Duration::from_millis(1) });
		let calls = Arc::new(AtomicU32::new(0));
		let calls2 = calls.clone();
		let next: Next = Arc::new(move |_req| {
			calls2.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Err(GatewayError::unavailable("down")) })
		});
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let err = retry.handle(req, next).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unavailable);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn does_not_retry_non_retryable_errors() {
		let retry = Retry::new(RetryPolicy { attempts: 3, backoff: Duration::from_millis(1) });
		let calls = Arc::new(AtomicU32::new(0));
		let calls2 = calls.clone();
		let next: Next = Arc::new(move |_req| {
			calls2.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Err(GatewayError::bad_request("nope")) })
		});
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let _ = retry.handle(req, next).await.unwrap_err();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn stops_retrying_once_successful() {
		let retry = Retry::new(RetryPolicy { attempts: 5, backoff: Duration::from_millis(1) });
		let calls = Arc::new(AtomicU32::new(0));
		let calls2 = calls.clone();
		let next: Next = Arc::new(move |_req| {
			let n = calls2.fetch_add(1, Ordering::SeqCst);
			Box::pin(async move {
				if n < 2 {
					Err(GatewayError::timeout("slow"))
				} else {
					Ok(http::Response::builder().status(200).body(Body::empty()).unwrap())
				}
			})
		});
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let resp = retry.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
