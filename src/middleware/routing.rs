//! Routing (spec §4.6): the route-aware wrapper that calls `Router::route` once and memoizes the
//! `RouteResult` into the request's extensions, so `Forward` (and anything downstream that
//! inspects it) reuses the same routing decision rather than re-matching or re-selecting an
//! instance. Must precede `Forward` per the declared composition order.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, Response};
use crate::router::Router;

pub struct Routing {
	router: Arc<Router>,
}

impl Routing {
	pub fn new(router: Arc<Router>) -> Self {
		Self { router }
	}
}

impl Middleware for Routing {
	fn handle(&self, mut req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let result = self.router.route(&req);
		Box::pin(async move {
			let result = result?;
			req.extensions_mut().insert(result);
			next(req).await
		})
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::balancer::LoadBalancer;
	use crate::registry::{Scheme, ServiceInstance, StaticRegistry};
	use crate::request::Body;
	use crate::router::{RouteMetadata, RouteResult, RouteRule};

	fn router_with_one_healthy_instance() -> Arc<Router> {
		let registry = StaticRegistry::new();
		registry.replace("svc", vec![ServiceInstance::new("i1", "127.0.0.1", 9000, Scheme::Http)]);
		let balancers: HashMap<String, Arc<dyn LoadBalancer>> = HashMap::new();
		let router = Router::new(Arc::new(registry), balancers);
		router.reload(vec![RouteRule {
			id: "rule".to_string(),
			pattern: crate::router::Pattern::parse("/api/*"),
			methods: vec![],
			service_name: "svc".to_string(),
			timeout: None,
			retries: None,
			metadata: RouteMetadata::default(),
			session_affinity: None,
			rate_limit: None,
		}]);
		Arc::new(router)
	}

	#[tokio::test]
	async fn memoizes_route_result_for_downstream_layers() {
		let routing = Routing::new(router_with_one_healthy_instance());
		let next: Next = Arc::new(|req| {
			Box::pin(async move {
				let result = req.extensions().get::<RouteResult>().expect("route result memoized");
				assert_eq!(result.service_name, "svc");
				Ok(http::Response::builder().status(200).body(Body::empty()).unwrap())
			})
		});
		let req = http::Request::builder().uri("/api/widgets").body(Body::empty()).unwrap();
		let resp = routing.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}

	#[tokio::test]
	async fn unmatched_route_is_not_found() {
		let routing = Routing::new(router_with_one_healthy_instance());
		let next: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let req = http::Request::builder().uri("/nope").body(Body::empty()).unwrap();
		let err = routing.handle(req, next).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
	}
}
