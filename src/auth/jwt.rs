//! JWT provider (spec §4.5): verifies a bearer token against inline PEM keys or a JWKS endpoint
//! fetched lazily with a TTL cache, validating issuer/audience/expiration and extracting subject
//! and scopes per the configured claim names. Grounded on the teacher's
//! `crates/agentgateway/src/http/jwt.rs` (`Jwt`, `Jwk`, JWKS-to-`DecodingKey` conversion).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use serde_json::Value;

use super::{AuthInfo, Credential, Provider, SubjectType};
use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub enum Audience {
	Single(String),
	Many(Vec<String>),
}

impl Audience {
	fn apply(&self, validation: &mut Validation) {
		match self {
			Audience::Single(a) => validation.set_audience(&[a.clone()]),
			Audience::Many(many) => validation.set_audience(many),
		}
	}
}

/// Source of verification keys: either a fixed inline PEM/HMAC secret or a JWKS endpoint cached
/// with a TTL and refreshed lazily on a `kid` miss.
pub enum KeySource {
	Inline { key: DecodingKey, algorithm: Algorithm },
	Jwks { url: String, ttl: Duration },
}

struct JwksCache {
	keys: HashMap<String, (DecodingKey, Algorithm)>,
	fetched_at: Instant,
}

pub struct JwtProvider {
	source: KeySource,
	issuer: Option<String>,
	audience: Option<Audience>,
	subject_claim: String,
	scope_claim: String,
	/// Extra claim name -> metadata key mappings, applied after subject/scope extraction.
	claim_metadata: HashMap<String, String>,
	http: reqwest::Client,
	cache: RwLock<Option<JwksCache>>,
}

impl JwtProvider {
	pub fn inline(key: DecodingKey, algorithm: Algorithm) -> Self {
		Self {
			source: KeySource::Inline { key, algorithm },
			issuer: None,
			audience: None,
			subject_claim: "sub".to_string(),
			scope_claim: "scope".to_string(),
			claim_metadata: HashMap::new(),
			http: reqwest::Client::new(),
			cache: RwLock::new(None),
		}
	}

	pub fn jwks(url: impl Into<String>, ttl: Duration) -> Self {
		Self {
			source: KeySource::Jwks { url: url.into(), ttl },
			issuer: None,
			audience: None,
			subject_claim: "sub".to_string(),
			scope_claim: "scope".to_string(),
			claim_metadata: HashMap::new(),
			http: reqwest::Client::new(),
			cache: RwLock::new(None),
		}
	}

	pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
		self.issuer = Some(issuer.into());
		self
	}

	pub fn with_audience(mut self, audience: Audience) -> Self {
		self.audience = Some(audience);
		self
	}

	pub fn with_subject_claim(mut self, claim: impl Into<String>) -> Self {
		self.subject_claim = claim.into();
		self
	}

	pub fn with_scope_claim(mut self, claim: impl Into<String>) -> Self {
		self.scope_claim = claim.into();
		self
	}

	pub fn with_claim_metadata(mut self, mapping: HashMap<String, String>) -> Self {
		self.claim_metadata = mapping;
		self
	}

	fn base_validation(&self, algorithm: Algorithm) -> Validation {
		let mut validation = Validation::new(algorithm);
		if let Some(issuer) = &self.issuer {
			validation.set_issuer(&[issuer.clone()]);
		}
		if let Some(audience) = &self.audience {
			audience.apply(&mut validation);
		} else {
			validation.validate_aud = false;
		}
		validation
	}

	async fn fetch_jwks(&self, url: &str) -> Result<HashMap<String, (DecodingKey, Algorithm)>, GatewayError> {
		let resp = self
			.http
			.get(url)
			.send()
			.await
			.map_err(|e| GatewayError::internal("failed to fetch JWKS").with_source(e))?;
		let jwks: JwkSet = resp
			.json()
			.await
			.map_err(|e| GatewayError::internal("failed to parse JWKS").with_source(e))?;

		let mut keys = HashMap::new();
		for jwk in jwks.keys {
			let Some(kid) = jwk.common.key_id.clone() else { continue };
			let algorithm = jwk
				.common
				.key_algorithm
				.and_then(|a| Algorithm::from_str_relaxed(&a.to_string()))
				.unwrap_or(Algorithm::RS256);
			let decoding = match &jwk.algorithm {
				AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
					.map_err(|e| GatewayError::internal("invalid RSA JWK").with_source(e))?,
				AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
					.map_err(|e| GatewayError::internal("invalid EC JWK").with_source(e))?,
				_ => continue,
			};
			keys.insert(kid, (decoding, algorithm));
		}
		Ok(keys)
	}

	async fn key_for(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm), GatewayError> {
		match &self.source {
			KeySource::Inline { key, algorithm } => Ok((key.clone(), *algorithm)),
			KeySource::Jwks { url, ttl } => {
				let kid = kid.ok_or_else(|| GatewayError::unauthorized("token header is missing `kid`"))?;

				{
					let cache = self.cache.read();
					if let Some(cache) = cache.as_ref() {
						if cache.fetched_at.elapsed() < *ttl {
							if let Some(found) = cache.keys.get(kid) {
								return Ok(found.clone());
							}
						}
					}
				}

				let keys = self.fetch_jwks(url).await?;
				let found = keys
					.get(kid)
					.cloned()
					.ok_or_else(|| GatewayError::unauthorized(format!("unknown JWKS key id '{kid}'")))?;
				*self.cache.write() = Some(JwksCache { keys, fetched_at: Instant::now() });
				Ok(found)
			},
		}
	}
}

/// `jsonwebtoken::Algorithm` has no `FromStr`; this mirrors the teacher's ad hoc conversion from
/// a JWK's `alg` string. Exposed as `parse_algorithm` for the config-driven provider in `app`.
trait AlgorithmExt: Sized {
	fn from_str_relaxed(s: &str) -> Option<Self>;
}

impl AlgorithmExt for Algorithm {
	fn from_str_relaxed(s: &str) -> Option<Self> {
		parse_algorithm(s)
	}
}

pub fn parse_algorithm(s: &str) -> Option<Algorithm> {
	match s {
		"HS256" => Some(Algorithm::HS256),
		"HS384" => Some(Algorithm::HS384),
		"HS512" => Some(Algorithm::HS512),
		"RS256" => Some(Algorithm::RS256),
		"RS384" => Some(Algorithm::RS384),
		"RS512" => Some(Algorithm::RS512),
		"ES256" => Some(Algorithm::ES256),
		"ES384" => Some(Algorithm::ES384),
		_ => None,
	}
}

fn extract_scopes(claims: &serde_json::Map<String, Value>, scope_claim: &str) -> Vec<String> {
	match claims.get(scope_claim) {
		Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
		Some(Value::Array(arr)) => arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
		_ => Vec::new(),
	}
}

#[async_trait]
impl Provider for JwtProvider {
	fn name(&self) -> &str {
		"jwt"
	}

	fn accepts(&self, credential: &Credential) -> bool {
		matches!(credential, Credential::Bearer(_))
	}

	async fn authenticate(&self, credential: &Credential) -> Result<AuthInfo, GatewayError> {
		let Credential::Bearer(token) = credential else {
			return Err(GatewayError::internal("jwt provider given a non-bearer credential"));
		};

		let header = decode_header(token).map_err(|e| GatewayError::unauthorized("malformed token header").with_source(e))?;
		let (key, algorithm) = self.key_for(header.kid.as_deref()).await?;
		let validation = self.base_validation(algorithm);

		let data = decode::<serde_json::Map<String, Value>>(token, &key, &validation)
			.map_err(|e| GatewayError::unauthorized("token failed validation").with_source(e))?;
		let claims = data.claims;

		let subject = claims
			.get(&self.subject_claim)
			.and_then(Value::as_str)
			.ok_or_else(|| GatewayError::unauthorized(format!("token is missing '{}' claim", self.subject_claim)))?
			.to_string();

		let scopes = extract_scopes(&claims, &self.scope_claim);

		let expires_at = claims
			.get("exp")
			.and_then(Value::as_u64)
			.map(|secs| std::time::UNIX_EPOCH + Duration::from_secs(secs));

		let mut metadata = HashMap::new();
		for (claim, meta_key) in &self.claim_metadata {
			if let Some(value) = claims.get(claim) {
				let rendered = match value {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				metadata.insert(meta_key.clone(), rendered);
			}
		}

		Ok(AuthInfo {
			subject,
			subject_type: SubjectType::User,
			scopes,
			metadata,
			expires_at,
			token: token.clone(),
		})
	}
}
