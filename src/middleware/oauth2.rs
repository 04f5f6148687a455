//! OAuth2 (spec §4.6): named in the composition order between `Auth` and `Authz` but given no
//! further behavior in spec §4.5/4.6 beyond its position — token introspection against an external
//! authorization server is an out-of-process collaborator, not something this core re-implements.
//! `OAuth2` is therefore an extension point: an optional `Introspector` hook that, when configured,
//! can reject or enrich the `AuthInfo` already attached by `Auth`; with no introspector configured
//! it's a pass-through, matching how `OAuth2Config` is absent from the required sections in spec §6.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::auth::AuthInfo;
use crate::error::GatewayError;
use crate::request::{Request, Response};

/// A pluggable hook for external token introspection (e.g. RFC 7662). Implementations may reject
/// the call or return a replacement `AuthInfo` (e.g. with introspection-derived scopes merged in).
#[async_trait]
pub trait Introspector: Send + Sync {
	async fn introspect(&self, info: &AuthInfo) -> Result<AuthInfo, GatewayError>;
}

pub struct OAuth2 {
	introspector: Option<Arc<dyn Introspector>>,
}

impl OAuth2 {
	pub fn passthrough() -> Self {
		Self { introspector: None }
	}

	pub fn with_introspector(introspector: Arc<dyn Introspector>) -> Self {
		Self { introspector: Some(introspector) }
	}
}

impl Middleware for OAuth2 {
	fn handle(&self, mut req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let introspector = self.introspector.clone();
		Box::pin(async move {
			if let Some(introspector) = introspector {
				if let Some(info) = req.extensions().get::<AuthInfo>().cloned() {
					let refreshed = introspector.introspect(&info).await?;
					req.extensions_mut().insert(refreshed);
				}
			}
			next(req).await
		})
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::auth::SubjectType;
	use crate::request::Body;

	fn sample_info(subject: &str) -> AuthInfo {
		AuthInfo {
			subject: subject.to_string(),
			subject_type: SubjectType::User,
			scopes: vec![],
			metadata: HashMap::new(),
			expires_at: None,
			token: "tok".to_string(),
		}
	}

	#[tokio::test]
	async fn passthrough_leaves_auth_info_untouched() {
		let oauth2 = OAuth2::passthrough();
		let next: Next = std::sync::Arc::new(|req| {
			Box::pin(async move {
				assert_eq!(req.extensions().get::<AuthInfo>().unwrap().subject, "alice");
				Ok(http::Response::builder().status(200).body(Body::empty()).unwrap())
			})
		});
		let mut req = http::Request::builder().body(Body::empty()).unwrap();
		req.extensions_mut().insert(sample_info("alice"));
		let resp = oauth2.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}

	struct RejectAll;
	#[async_trait]
	impl Introspector for RejectAll {
		async fn introspect(&self, _info: &AuthInfo) -> Result<AuthInfo, GatewayError> {
			Err(GatewayError::unauthorized("token revoked"))
		}
	}

	#[tokio::test]
	async fn introspector_can_reject_an_already_authenticated_request() {
		let oauth2 = OAuth2::with_introspector(Arc::new(RejectAll));
		let next: Next = std::sync::Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let mut req = http::Request::builder().body(Body::empty()).unwrap();
		req.extensions_mut().insert(sample_info("alice"));
		let err = oauth2.handle(req, next).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
	}
}
