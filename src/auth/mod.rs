//! Auth Pipeline (spec §4.5): pluggable `Provider`s validate a credential extracted from the
//! request by a protocol-bound `Extractor`, producing an `AuthInfo` that's attached to the
//! request context for downstream middleware (authz, rate limiting) to consult.

pub mod apikey;
pub mod jwt;

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
	User,
	Service,
	Device,
}

/// Placed in the request's extensions by the auth middleware once a provider accepts the
/// presented credential (spec §3).
#[derive(Debug, Clone)]
pub struct AuthInfo {
	pub subject: String,
	pub subject_type: SubjectType,
	pub scopes: Vec<String>,
	pub metadata: HashMap<String, String>,
	pub expires_at: Option<SystemTime>,
	pub token: String,
}

impl AuthInfo {
	pub fn has_scope(&self, scope: &str) -> bool {
		self.scopes.iter().any(|s| s == scope)
	}

	pub fn has_all_scopes(&self, required: &[String]) -> bool {
		required.iter().all(|r| self.has_scope(r))
	}
}

/// A typed credential extracted from the request, before any provider has validated it.
#[derive(Debug, Clone)]
pub enum Credential {
	Bearer(String),
	ApiKey(String),
}

impl Credential {
	pub fn kind(&self) -> &'static str {
		match self {
			Credential::Bearer(_) => "bearer",
			Credential::ApiKey(_) => "apikey",
		}
	}
}

/// Each frontend protocol binds one extractor; a gateway may configure several (e.g. header and
/// cookie) and the first match wins.
#[derive(Debug, Clone)]
pub enum Extractor {
	AuthorizationBearer,
	Header(String),
	Cookie(String),
	Query(String),
}

impl Extractor {
	pub fn extract(&self, req: &Request) -> Option<Credential> {
		match self {
			Extractor::AuthorizationBearer => req
				.headers()
				.get(http::header::AUTHORIZATION)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.strip_prefix("Bearer "))
				.map(|tok| Credential::Bearer(tok.to_string())),
			Extractor::Header(name) => req
				.headers()
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(|v| Credential::ApiKey(v.to_string())),
			Extractor::Cookie(name) => req
				.headers()
				.get_all(http::header::COOKIE)
				.iter()
				.filter_map(|v| v.to_str().ok())
				.flat_map(|v| v.split(';'))
				.find_map(|pair| {
					let pair = pair.trim();
					let (k, v) = pair.split_once('=')?;
					(k == name).then(|| Credential::ApiKey(v.to_string()))
				}),
			Extractor::Query(name) => req.uri().query().and_then(|q| {
				url::form_urlencoded::parse(q.as_bytes())
					.find(|(k, _)| k == name)
					.map(|(_, v)| Credential::ApiKey(v.into_owned()))
			}),
		}
	}
}

/// A pluggable authentication backend. `Authenticate` validates a credential it recognizes;
/// providers that don't handle a given credential kind simply aren't dispatched to it.
#[async_trait]
pub trait Provider: Send + Sync {
	fn name(&self) -> &str;
	/// Whether this provider accepts credentials of this kind at all (cheap pre-filter before
	/// the async `authenticate` call).
	fn accepts(&self, credential: &Credential) -> bool;
	async fn authenticate(&self, credential: &Credential) -> Result<AuthInfo, GatewayError>;
}

pub struct AuthPipeline {
	extractors: Vec<Extractor>,
	providers: Vec<std::sync::Arc<dyn Provider>>,
	skip_paths: Vec<String>,
	required_scopes: Vec<String>,
	required: bool,
}

impl AuthPipeline {
	pub fn new(extractors: Vec<Extractor>, providers: Vec<std::sync::Arc<dyn Provider>>) -> Self {
		Self {
			extractors,
			providers,
			skip_paths: Vec::new(),
			required_scopes: Vec::new(),
			required: true,
		}
	}

	pub fn with_skip_paths(mut self, paths: Vec<String>) -> Self {
		self.skip_paths = paths;
		self
	}

	pub fn with_required_scopes(mut self, scopes: Vec<String>) -> Self {
		self.required_scopes = scopes;
		self
	}

	/// When `false`, an absent/unacceptable credential passes through without an `AuthInfo`
	/// rather than failing with 401 (spec §4.5: "absent = 401 (when required) or pass-through").
	pub fn with_required(mut self, required: bool) -> Self {
		self.required = required;
		self
	}

	fn skips(&self, path: &str) -> bool {
		self.skip_paths.iter().any(|p| p == path)
	}

	/// Runs extraction + provider dispatch + scope enforcement, returning the `AuthInfo` to be
	/// stashed in the request's extensions by the caller.
	pub async fn authenticate(&self, req: &Request) -> Result<Option<AuthInfo>, GatewayError> {
		if self.skips(req.uri().path()) {
			return Ok(None);
		}

		let credential = self.extractors.iter().find_map(|e| e.extract(req));
		let Some(credential) = credential else {
			return if self.required {
				Err(GatewayError::unauthorized("no credential presented"))
			} else {
				Ok(None)
			};
		};

		let provider = self.providers.iter().find(|p| p.accepts(&credential));
		let Some(provider) = provider else {
			return if self.required {
				Err(GatewayError::unauthorized(format!("no provider accepts a {} credential", credential.kind())))
			} else {
				Ok(None)
			};
		};

		let info = provider.authenticate(&credential).await?;

		if !self.required_scopes.is_empty() && !info.has_all_scopes(&self.required_scopes) {
			return Err(GatewayError::forbidden("missing required scope"));
		}

		Ok(Some(info))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn req_with_header(name: &str, value: &str) -> Request {
		http::Request::builder()
			.header(name, value)
			.body(crate::request::Body::empty())
			.unwrap()
	}

	#[test]
	fn bearer_extractor_strips_prefix() {
		let req = req_with_header("authorization", "Bearer abc123");
		let cred = Extractor::AuthorizationBearer.extract(&req);
		assert!(matches!(cred, Some(Credential::Bearer(t)) if t == "abc123"));
	}

	#[test]
	fn header_extractor_yields_api_key() {
		let req = req_with_header("x-api-key", "secret");
		let cred = Extractor::Header("x-api-key".to_string()).extract(&req);
		assert!(matches!(cred, Some(Credential::ApiKey(k)) if k == "secret"));
	}

	struct AlwaysReject;

	#[async_trait]
	impl Provider for AlwaysReject {
		fn name(&self) -> &str {
			"reject"
		}
		fn accepts(&self, _credential: &Credential) -> bool {
			true
		}
		async fn authenticate(&self, _credential: &Credential) -> Result<AuthInfo, GatewayError> {
			Err(GatewayError::unauthorized("rejected"))
		}
	}

	#[tokio::test]
	async fn missing_credential_is_unauthorized_when_required() {
		let pipeline = AuthPipeline::new(vec![Extractor::AuthorizationBearer], vec![std::sync::Arc::new(AlwaysReject)]);
		let req = http::Request::builder().body(crate::request::Body::empty()).unwrap();
		let err = pipeline.authenticate(&req).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
	}

	#[tokio::test]
	async fn missing_credential_passes_through_when_optional() {
		let pipeline = AuthPipeline::new(vec![Extractor::AuthorizationBearer], vec![std::sync::Arc::new(AlwaysReject)]).with_required(false);
		let req = http::Request::builder().body(crate::request::Body::empty()).unwrap();
		let info = pipeline.authenticate(&req).await.unwrap();
		assert!(info.is_none());
	}

	#[tokio::test]
	async fn skip_paths_bypass_the_pipeline() {
		let pipeline = AuthPipeline::new(vec![Extractor::AuthorizationBearer], vec![std::sync::Arc::new(AlwaysReject)])
			.with_skip_paths(vec!["/_gateway/health".to_string()]);
		let req = http::Request::builder().uri("/_gateway/health").body(crate::request::Body::empty()).unwrap();
		let info = pipeline.authenticate(&req).await.unwrap();
		assert!(info.is_none());
	}
}
