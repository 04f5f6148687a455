//! Authz (spec §4.6): per-route scope enforcement, distinct from the Auth Pipeline's own global
//! `required_scopes` (spec §4.5) — this layer reads a route-specific scope list out of the matched
//! rule's metadata (`{"authz": {"required_scopes": [...]}}`), so different routes on the same
//! gateway can demand different scopes. Runs after `Auth`/`OAuth2`, before `RateLimit`, and (like
//! `RateLimit`) resolves its own rule match via `Router::match_rule` since `Routing` hasn't run yet.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::auth::AuthInfo;
use crate::error::GatewayError;
use crate::request::{Request, Response};
use crate::router::Router;

pub struct Authz {
	router: Arc<Router>,
}

impl Authz {
	pub fn new(router: Arc<Router>) -> Self {
		Self { router }
	}

	fn required_scopes(&self, req: &Request) -> Vec<String> {
		let Some(rule) = self.router.match_rule(req) else { return Vec::new() };
		rule
			.metadata
			.0
			.get("authz")
			.and_then(|v| v.get("required_scopes"))
			.and_then(|v| v.as_array())
			.map(|arr| arr.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
			.unwrap_or_default()
	}
}

impl Middleware for Authz {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let required = self.required_scopes(&req);
		if required.is_empty() {
			return Box::pin(next(req));
		}

		let ok = req.extensions().get::<AuthInfo>().map(|info| info.has_all_scopes(&required)).unwrap_or(false);
		if ok {
			Box::pin(next(req))
		} else {
			Box::pin(async { Err(GatewayError::forbidden("missing required scope for this route")) })
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::auth::SubjectType;
	use crate::balancer::LoadBalancer;
	use crate::registry::StaticRegistry;
	use crate::request::Body;
	use crate::router::{RouteMetadata, RouteRule};

	fn router_with_required_scopes(scopes: &[&str]) -> Arc<Router> {
		let metadata = RouteMetadata(HashMap::from([(
			"authz".to_string(),
			serde_json::json!({"required_scopes": scopes}),
		)]));
		let rule = RouteRule {
			id: "rule".to_string(),
			pattern: crate::router::Pattern::parse("/api/*"),
			methods: vec![],
			service_name: "svc".to_string(),
			timeout: None,
			retries: None,
			metadata,
			session_affinity: None,
			rate_limit: None,
		};
		let balancers: HashMap<String, Arc<dyn LoadBalancer>> = HashMap::new();
		let router = Router::new(Arc::new(StaticRegistry::new()), balancers);
		router.reload(vec![rule]);
		Arc::new(router)
	}

	fn info_with_scopes(scopes: &[&str]) -> AuthInfo {
		AuthInfo {
			subject: "s".to_string(),
			subject_type: SubjectType::User,
			scopes: scopes.iter().map(|s| s.to_string()).collect(),
			metadata: HashMap::new(),
			expires_at: None,
			token: "t".to_string(),
		}
	}

	#[tokio::test]
	async fn missing_required_scope_is_forbidden() {
		let authz = Authz::new(router_with_required_scopes(&["admin"]));
		let next: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let mut req = http::Request::builder().uri("/api/widgets").body(Body::empty()).unwrap();
		req.extensions_mut().insert(info_with_scopes(&["read"]));
		let err = authz.handle(req, next).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
	}

	#[tokio::test]
	async fn matching_scope_passes_through() {
		let authz = Authz::new(router_with_required_scopes(&["admin"]));
		let next: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let mut req = http::Request::builder().uri("/api/widgets").body(Body::empty()).unwrap();
		req.extensions_mut().insert(info_with_scopes(&["admin"]));
		let resp = authz.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}

	#[tokio::test]
	async fn routes_without_a_scope_requirement_pass_through_unauthenticated() {
		let authz = Authz::new(router_with_required_scopes(&[]));
		let next: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let req = http::Request::builder().uri("/api/widgets").body(Body::empty()).unwrap();
		let resp = authz.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}
}
