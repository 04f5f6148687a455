//! Auth (spec §4.6): the middleware-chain layer around the Auth Pipeline (spec §4.5). Stashes the
//! resulting `AuthInfo` into the request's extensions for downstream layers (OAuth2, Authz, rate
//! limiting keyed on subject) to consult, and lets pipeline failures (missing/rejected credential)
//! surface as the `Unauthorized`/`Forbidden` errors the pipeline itself produces.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::auth::AuthPipeline;
use crate::error::GatewayError;
use crate::request::{Request, Response};

pub struct Auth {
	pipeline: Arc<AuthPipeline>,
}

impl Auth {
	pub fn new(pipeline: AuthPipeline) -> Self {
		Self { pipeline: Arc::new(pipeline) }
	}
}

impl Middleware for Auth {
	fn handle(&self, mut req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let pipeline = self.pipeline.clone();
		Box::pin(async move {
			if let Some(info) = pipeline.authenticate(&req).await? {
				req.extensions_mut().insert(info);
			}
			next(req).await
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use async_trait::async_trait;

	use super::*;
	use crate::auth::{AuthInfo, Credential, Extractor, Provider, SubjectType};
	use crate::request::Body;

	struct AlwaysAccept;

	#[async_trait]
	impl Provider for AlwaysAccept {
		fn name(&self) -> &str {
			"always"
		}
		fn accepts(&self, _credential: &Credential) -> bool {
			true
		}
		async fn authenticate(&self, _credential: &Credential) -> Result<AuthInfo, GatewayError> {
			Ok(AuthInfo {
				subject: "user-1".to_string(),
				subject_type: SubjectType::User,
				scopes: vec!["read".to_string()],
				metadata: Default::default(),
				expires_at: None,
				token: "tok".to_string(),
			})
		}
	}

	#[tokio::test]
	async fn accepted_credential_attaches_auth_info_for_downstream_layers() {
		let pipeline = AuthPipeline::new(vec![Extractor::AuthorizationBearer], vec![Arc::new(AlwaysAccept)]);
		let auth = Auth::new(pipeline);
		let next: Next = Arc::new(|req| {
			Box::pin(async move {
				let info = req.extensions().get::<AuthInfo>().cloned();
				assert_eq!(info.map(|i| i.subject), Some("user-1".to_string()));
				Ok(http::Response::builder().status(200).body(Body::empty()).unwrap())
			})
		});
		let req = http::Request::builder().header("authorization", "Bearer x").body(Body::empty()).unwrap();
		let resp = auth.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}
}
