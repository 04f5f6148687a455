//! Middleware Chain (spec §4.6): composes recovery/metrics/telemetry/breaker/retry/auth/oauth2/
//! authz/rate-limit/routing/forward into one callable, in the load-bearing order spec'd, *by
//! construction* rather than by convention (spec §9 design note: "Middleware as higher-order
//! functions"). Grounded on the teacher's tower-based composition idiom (`tower::Service` layers
//! in `crates/agentgateway/src/http/*`), generalized here to a boxed-future chain since the
//! gateway proxies several wire protocols, not just one `tower::Service` request/response pair.

pub mod auth;
pub mod authz;
pub mod circuit_breaker;
pub mod forward;
pub mod metrics;
pub mod oauth2;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod routing;
pub mod telemetry;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::GatewayError;
use crate::request::{Request, Response};

pub type Next = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, GatewayError>> + Send + Sync>;

/// One link in the chain. Implementors call `next(req)` to continue; not calling it short-
/// circuits (e.g. the circuit breaker rejecting a call, the rate limiter denying a request).
pub trait Middleware: Send + Sync + 'static {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>>;
}

/// Builds the fixed composition order of spec §4.6:
/// `Recovery -> Metrics -> Telemetry -> CircuitBreaker -> Retry -> Auth -> OAuth2 -> Authz ->
/// RateLimit -> Routing -> Forward`. `layers` must be supplied in that order, outermost first;
/// `terminal` is the innermost call (ordinarily `forward::dispatch`).
pub struct Chain {
	entry: Next,
}

impl Chain {
	pub fn new(layers: Vec<Arc<dyn Middleware>>, terminal: Next) -> Self {
		let entry = layers.into_iter().rev().fold(terminal, |next, layer| {
			let layer = layer.clone();
			Arc::new(move |req: Request| layer.handle(req, next.clone())) as Next
		});
		Self { entry }
	}

	pub async fn run(&self, req: Request) -> Result<Response, GatewayError> {
		(self.entry)(req).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::request::Body;

	struct RecordOrder {
		name: &'static str,
		order: Arc<std::sync::Mutex<Vec<&'static str>>>,
	}

	impl Middleware for RecordOrder {
		fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
			self.order.lock().unwrap().push(self.name);
			Box::pin(next(req))
		}
	}

	#[tokio::test]
	async fn layers_execute_outermost_first() {
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));
		let layers: Vec<Arc<dyn Middleware>> = vec![
			Arc::new(RecordOrder { name: "a", order: order.clone() }),
			Arc::new(RecordOrder { name: "b", order: order.clone() }),
		];
		let terminal: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let chain = Chain::new(layers, terminal);
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let _ = chain.run(req).await.unwrap();
		assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
	}

	#[tokio::test]
	async fn a_layer_can_short_circuit() {
		struct Blocker;
		impl Middleware for Blocker {
			fn handle(&self, _req: Request, _next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
				Box::pin(async { Err(GatewayError::forbidden("blocked")) })
			}
		}
		let reached = Arc::new(AtomicUsize::new(0));
		let reached2 = reached.clone();
		let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(Blocker)];
		let terminal: Next = Arc::new(move |_req| {
			reached2.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) })
		});
		let chain = Chain::new(layers, terminal);
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let err = chain.run(req).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
		assert_eq!(reached.load(Ordering::SeqCst), 0);
	}
}
