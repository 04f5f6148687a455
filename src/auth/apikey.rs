//! API-key provider (spec §4.5): looks up a presented key (optionally pre-hashed with SHA-256)
//! in an in-memory table, rejecting disabled or expired keys.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::{AuthInfo, Credential, Provider, SubjectType};
use crate::error::GatewayError;

#[derive(Clone)]
pub struct KeyConfig {
	pub subject: String,
	pub subject_type: SubjectType,
	pub scopes: Vec<String>,
	pub disabled: bool,
	pub expires_at: Option<SystemTime>,
}

pub struct ApiKeyProvider {
	/// Keyed by the raw key or, when `hashed` is set, its SHA-256 hex digest — the table never
	/// stores the presented secret in cleartext when hashing is enabled.
	keys: HashMap<String, KeyConfig>,
	hashed: bool,
	default_scopes: Vec<String>,
}

impl ApiKeyProvider {
	pub fn new(keys: HashMap<String, KeyConfig>, hashed: bool, default_scopes: Vec<String>) -> Self {
		Self { keys, hashed, default_scopes }
	}

	fn lookup_key(&self, presented: &SecretString) -> String {
		if self.hashed {
			let mut hasher = Sha256::new();
			hasher.update(presented.expose_secret().as_bytes());
			hex::encode(hasher.finalize())
		} else {
			presented.expose_secret().to_string()
		}
	}
}

mod hex {
	pub fn encode(bytes: impl AsRef<[u8]>) -> String {
		bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
	}
}

#[async_trait]
impl Provider for ApiKeyProvider {
	fn name(&self) -> &str {
		"apikey"
	}

	fn accepts(&self, credential: &Credential) -> bool {
		matches!(credential, Credential::ApiKey(_))
	}

	async fn authenticate(&self, credential: &Credential) -> Result<AuthInfo, GatewayError> {
		let Credential::ApiKey(presented) = credential else {
			return Err(GatewayError::internal("apikey provider given a non-apikey credential"));
		};
		let lookup = self.lookup_key(&SecretString::new(presented.clone().into()));
		let config = self.keys.get(&lookup).ok_or_else(|| GatewayError::unauthorized("unknown API key"))?;

		if config.disabled {
			return Err(GatewayError::unauthorized("API key is disabled"));
		}
		if let Some(expires_at) = config.expires_at {
			if expires_at <= SystemTime::now() {
				return Err(GatewayError::unauthorized("API key has expired"));
			}
		}

		let mut scopes = self.default_scopes.clone();
		for scope in &config.scopes {
			if !scopes.contains(scope) {
				scopes.push(scope.clone());
			}
		}

		Ok(AuthInfo {
			subject: config.subject.clone(),
			subject_type: config.subject_type,
			scopes,
			metadata: HashMap::new(),
			expires_at: config.expires_at,
			token: presented.clone(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn provider() -> ApiKeyProvider {
		let mut keys = HashMap::new();
		keys.insert(
			"key-123".to_string(),
			KeyConfig {
				subject: "svc-a".to_string(),
				subject_type: SubjectType::Service,
				scopes: vec!["read".to_string()],
				disabled: false,
				expires_at: None,
			},
		);
		keys.insert(
			"key-disabled".to_string(),
			KeyConfig {
				subject: "svc-b".to_string(),
				subject_type: SubjectType::Service,
				scopes: vec![],
				disabled: true,
				expires_at: None,
			},
		);
		ApiKeyProvider::new(keys, false, vec!["default".to_string()])
	}

	#[tokio::test]
	async fn valid_key_yields_auth_info_with_union_scopes() {
		let p = provider();
		let info = p.authenticate(&Credential::ApiKey("key-123".to_string())).await.unwrap();
		assert_eq!(info.subject, "svc-a");
		assert!(info.has_scope("read"));
		assert!(info.has_scope("default"));
	}

	#[tokio::test]
	async fn disabled_key_is_rejected() {
		let p = provider();
		let err = p.authenticate(&Credential::ApiKey("key-disabled".to_string())).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
	}

	#[tokio::test]
	async fn unknown_key_is_rejected() {
		let p = provider();
		let err = p.authenticate(&Credential::ApiKey("nope".to_string())).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
	}

	#[tokio::test]
	async fn expired_key_is_rejected() {
		let mut keys = HashMap::new();
		keys.insert(
			"exp".to_string(),
			KeyConfig {
				subject: "svc-c".to_string(),
				subject_type: SubjectType::User,
				scopes: vec![],
				disabled: false,
				expires_at: Some(SystemTime::UNIX_EPOCH),
			},
		);
		let p = ApiKeyProvider::new(keys, false, vec![]);
		let err = p.authenticate(&Credential::ApiKey("exp".to_string())).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
	}
}
