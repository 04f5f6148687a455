//! Rate limit (spec §4.6): token-bucket keyed by a selector (subject, remote-addr, route) with
//! per-route overrides drawn from the matched `RouteRule`'s own `rate_limit` field (spec §4.3),
//! falling back to a gateway-wide default. This layer runs before `Routing` in the declared
//! composition order, so it resolves the matching rule itself via `Router::match_rule` (pattern
//! matching only, no instance selection) rather than waiting for the routing layer's memoized
//! `RouteResult`. Grounded on the teacher's `http/localratelimit.rs` token-bucket shape;
//! reimplemented over `parking_lot` directly since this gateway doesn't carry the teacher's
//! `ratelimit` crate dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{Middleware, Next};
use crate::auth::AuthInfo;
use crate::error::GatewayError;
use crate::request::{Request, Response};
use crate::router::{RateLimitOverride, Router};

#[derive(Debug, Clone, Copy)]
pub enum Selector {
	Subject,
	RemoteAddr,
	Route,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
	pub requests_per_second: f64,
	pub burst: u32,
}

impl From<&RateLimitOverride> for RateLimitConfig {
	fn from(o: &RateLimitOverride) -> Self {
		Self { requests_per_second: o.requests_per_second, burst: o.burst }
	}
}

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

impl Bucket {
	fn new(burst: u32) -> Self {
		Self { tokens: burst as f64, last_refill: Instant::now() }
	}

	fn try_take(&mut self, config: &RateLimitConfig) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.last_refill = now;
		self.tokens = (self.tokens + elapsed * config.requests_per_second).min(config.burst as f64);
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

pub struct RateLimit {
	selector: Selector,
	default_config: RateLimitConfig,
	router: Arc<Router>,
	buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimit {
	pub fn new(selector: Selector, default_config: RateLimitConfig, router: Arc<Router>) -> Self {
		Self { selector, default_config, router, buckets: Mutex::new(HashMap::new()) }
	}

	fn key(&self, req: &Request) -> String {
		match self.selector {
			Selector::Subject => req
				.extensions()
				.get::<AuthInfo>()
				.map(|info| info.subject.clone())
				.unwrap_or_else(|| "anonymous".to_string()),
			Selector::RemoteAddr => req
				.extensions()
				.get::<crate::request::RequestContext>()
				.and_then(|ctx| ctx.remote_addr)
				.map(|addr| addr.ip().to_string())
				.unwrap_or_else(|| "unknown".to_string()),
			Selector::Route => req.uri().path().to_string(),
		}
	}
}

impl Middleware for RateLimit {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let key = self.key(&req);
		let config = self
			.router
			.match_rule(&req)
			.and_then(|rule| rule.rate_limit.as_ref().map(RateLimitConfig::from))
			.unwrap_or(self.default_config);

		let allowed = {
			let mut buckets = self.buckets.lock();
			let bucket = buckets.entry(key).or_insert_with(|| Bucket::new(config.burst));
			bucket.try_take(&config)
		};

		if allowed {
			Box::pin(next(req))
		} else {
			Box::pin(async { Err(GatewayError::rate_limited("rate limit exceeded")) })
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::request::Body;

	fn passthrough() -> Next {
		Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }))
	}

	fn empty_router() -> Arc<Router> {
		Arc::new(Router::new(Arc::new(crate::registry::StaticRegistry::new()), HashMap::new()))
	}

	#[tokio::test]
	async fn exhausted_bucket_rejects_with_rate_limit_kind() {
		let limiter = RateLimit::new(Selector::RemoteAddr, RateLimitConfig { requests_per_second: 0.0, burst: 1 }, empty_router());
		let req = || http::Request::builder().body(Body::empty()).unwrap();

		let first = limiter.handle(req(), passthrough()).await;
		assert!(first.is_ok());
		let second = limiter.handle(req(), passthrough()).await;
		let err = second.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::RateLimit);
	}

	#[tokio::test]
	async fn different_keys_have_independent_buckets() {
		let limiter = RateLimit::new(Selector::Subject, RateLimitConfig { requests_per_second: 0.0, burst: 1 }, empty_router());

		let mut req_a = http::Request::builder().body(Body::empty()).unwrap();
		req_a.extensions_mut().insert(AuthInfo {
			subject: "a".to_string(),
			subject_type: crate::auth::SubjectType::User,
			scopes: vec![],
			metadata: HashMap::new(),
			expires_at: None,
			token: "t".to_string(),
		});
		let mut req_b = http::Request::builder().body(Body::empty()).unwrap();
		req_b.extensions_mut().insert(AuthInfo {
			subject: "b".to_string(),
			subject_type: crate::auth::SubjectType::User,
			scopes: vec![],
			metadata: HashMap::new(),
			expires_at: None,
			token: "t".to_string(),
		});

		assert!(limiter.handle(req_a, passthrough()).await.is_ok());
		assert!(limiter.handle(req_b, passthrough()).await.is_ok());
	}
}
