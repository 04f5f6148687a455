//! Configuration (spec §6, out of scope for *loading* but not for the typed shape the core
//! consumes): one nested structure mirroring the sections spec §6 names. `#[serde(deny_unknown_fields)]`
//! on the outer struct catches typos in the YAML the host loads and hands us. A narrow set of
//! operational knobs (bind addresses, log level, shutdown deadline) can be overridden by
//! environment variables via the small `parse::<T>(env) -> Option<T>` helper idiom, matching the
//! teacher's `crates/agentgateway/src/config.rs`.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub frontend: FrontendConfig,
	#[serde(default)]
	pub backend: BackendConfig,
	#[serde(default)]
	pub registry: RegistryConfig,
	#[serde(default)]
	pub router: RouterConfig,
	#[serde(default)]
	pub auth: Option<AuthConfig>,
	#[serde(default)]
	pub middleware: MiddlewareConfig,
	#[serde(default)]
	pub cors: Option<CorsConfig>,
	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,
	#[serde(default)]
	pub circuit_breaker: Option<CircuitBreakerConfig>,
	#[serde(default)]
	pub retry: Option<RetryConfig>,
	#[serde(default)]
	pub health: HealthConfig,
	#[serde(default)]
	pub metrics: MetricsConfig,
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub management: ManagementConfig,
	#[serde(default)]
	pub session: SessionConfig,
	#[serde(default)]
	pub balancer: BalancerConfig,
	#[serde(default)]
	pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
	pub capacity: usize,
	pub ttl_secs: u64,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self { capacity: 10_000, ttl_secs: 300 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BalancerConfig {
	/// `weighted_random` (default) or `smooth_wrr`.
	pub policy: String,
}

impl Default for BalancerConfig {
	fn default() -> Self {
		Self { policy: "weighted_random".to_string() }
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
	/// Tokio worker thread count: a plain integer, or a `"N%"` fraction of
	/// `std::thread::available_parallelism()` (spec `SPEC_FULL.md` §10.3). `None` leaves the
	/// decision to tokio's own default.
	pub worker_threads: Option<String>,
}

/// Resolves a [`RuntimeConfig::worker_threads`] spec into a concrete thread count. Accepts a bare
/// integer (`"4"`) or a percentage of the available parallelism (`"50%"`, rounded down, floored
/// at 1). Returns `None` for anything it can't parse, leaving the caller to fall back to tokio's
/// default sizing.
pub fn resolve_worker_threads(spec: &str) -> Option<usize> {
	let spec = spec.trim();
	if let Some(pct) = spec.strip_suffix('%') {
		let pct: f64 = pct.trim().parse().ok()?;
		let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
		let threads = (available * pct / 100.0).floor() as usize;
		return Some(threads.max(1));
	}
	spec.parse::<usize>().ok().map(|n| n.max(1))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrontendConfig {
	pub http: HttpFrontendConfig,
	pub websocket: WebSocketFrontendConfig,
	pub sse: SseFrontendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpFrontendConfig {
	pub bind_addr: String,
	/// `413 Request body too large` beyond this size (spec §6).
	pub max_request_size_bytes: u64,
}

impl Default for HttpFrontendConfig {
	fn default() -> Self {
		Self { bind_addr: "0.0.0.0:8080".to_string(), max_request_size_bytes: 10 * 1024 * 1024 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebSocketFrontendConfig {
	pub bind_addr: String,
	pub max_connections: usize,
	pub subprotocols: Vec<String>,
}

impl Default for WebSocketFrontendConfig {
	fn default() -> Self {
		Self { bind_addr: "0.0.0.0:8081".to_string(), max_connections: 10_000, subprotocols: Vec::new() }
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SseFrontendConfig {
	/// Paths that route into the SSE pipeline regardless of the request's `Accept` header.
	pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendConfig {
	pub http: BackendHttpConfig,
	pub grpc: BackendGrpcConfig,
	pub websocket: BackendWebSocketConfig,
	pub sse: BackendSseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendHttpConfig {
	pub default_timeout_secs: u64,
}

impl Default for BackendHttpConfig {
	fn default() -> Self {
		Self { default_timeout_secs: 30 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendGrpcConfig {
	pub keepalive_time_secs: u64,
	pub keepalive_timeout_secs: u64,
}

impl Default for BackendGrpcConfig {
	fn default() -> Self {
		Self { keepalive_time_secs: 30, keepalive_timeout_secs: 10 }
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendWebSocketConfig {
	pub origin_allow_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendSseConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
	#[serde(default)]
	pub services: HashMap<String, Vec<ServiceInstanceConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInstanceConfig {
	pub id: String,
	pub address: String,
	pub port: u16,
	pub scheme: crate::registry::Scheme,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
	#[serde(default)]
	pub weight: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
	#[serde(default)]
	pub rules: Vec<RouteRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRuleConfig {
	pub id: String,
	pub path: String,
	#[serde(default)]
	pub methods: Vec<String>,
	pub service: String,
	#[serde(default)]
	pub timeout_secs: Option<u64>,
	#[serde(default)]
	pub retries: Option<u8>,
	#[serde(default)]
	pub metadata: HashMap<String, serde_json::Value>,
	#[serde(default)]
	pub rate_limit: Option<RouteRateLimitConfig>,
	#[serde(default)]
	pub session_affinity: Option<SessionAffinityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionAffinityConfig {
	/// `cookie`, `header`, or `query`.
	pub source: String,
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRateLimitConfig {
	pub requests_per_second: f64,
	pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
	#[serde(default)]
	pub jwt: Option<JwtProviderConfig>,
	#[serde(default)]
	pub api_key: Option<ApiKeyProviderConfig>,
	#[serde(default)]
	pub skip_paths: Vec<String>,
	#[serde(default)]
	pub required_scopes: Vec<String>,
	#[serde(default = "default_true")]
	pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtProviderConfig {
	#[serde(default)]
	pub jwks_url: Option<String>,
	#[serde(default)]
	pub inline_key: Option<String>,
	pub algorithm: String,
	#[serde(default)]
	pub issuer: Option<String>,
	#[serde(default)]
	pub audience: Vec<String>,
	#[serde(default)]
	pub subject_claim: Option<String>,
	#[serde(default)]
	pub scope_claim: Option<String>,
	#[serde(default)]
	pub jwks_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyProviderConfig {
	#[serde(default)]
	pub hashed: bool,
	#[serde(default)]
	pub default_scopes: Vec<String>,
	/// Presented key (or, when `hashed`, its hex-encoded SHA-256 digest) to its entry.
	#[serde(default)]
	pub keys: HashMap<String, ApiKeyEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyEntryConfig {
	pub subject: String,
	#[serde(default)]
	pub subject_type: Option<String>,
	#[serde(default)]
	pub scopes: Vec<String>,
	#[serde(default)]
	pub disabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MiddlewareConfig {
	pub authz_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
	#[serde(default)]
	pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
	pub requests_per_second: f64,
	pub burst: u32,
	#[serde(default)]
	pub selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
	#[serde(default)]
	pub failure_threshold: Option<u32>,
	#[serde(default)]
	pub open_duration_secs: Option<u64>,
	#[serde(default)]
	pub half_open_success_threshold: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
	#[serde(default)]
	pub attempts: Option<u8>,
	#[serde(default)]
	pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
	pub interval_secs: u64,
	pub timeout_secs: u64,
	pub healthy_threshold: u32,
	pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self { interval_secs: 10, timeout_secs: 2, healthy_threshold: 2, unhealthy_threshold: 3 }
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MetricsConfig {
	pub enabled: bool,
	pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryConfig {
	pub log_level: String,
	pub log_format: String,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self { log_level: "info".to_string(), log_format: "text".to_string() }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManagementConfig {
	pub bind_addr: Option<String>,
	pub health_aliases: bool,
	pub shutdown_deadline_secs: u64,
}

impl Default for ManagementConfig {
	fn default() -> Self {
		Self { bind_addr: None, health_aliases: false, shutdown_deadline_secs: 30 }
	}
}

impl Config {
	pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
		let mut config: Config = serde_yaml::from_str(contents)?;
		config.apply_env_overrides()?;
		Ok(config)
	}

	/// Only a narrow set of operational knobs are env-overridable (spec `SPEC_FULL.md` §10.3):
	/// bind addresses, log level, and the shutdown deadline. Everything else (routes, auth
	/// providers, registry membership) comes from the YAML document itself.
	fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
		if let Some(v) = parse::<String>("GATEWAY_HTTP_BIND_ADDR")? {
			self.frontend.http.bind_addr = v;
		}
		if let Some(v) = parse::<String>("GATEWAY_WS_BIND_ADDR")? {
			self.frontend.websocket.bind_addr = v;
		}
		if let Some(v) = parse::<String>("GATEWAY_LOG_LEVEL")? {
			self.telemetry.log_level = v;
		}
		if let Some(v) = parse::<u64>("GATEWAY_SHUTDOWN_DEADLINE_SECONDS")? {
			self.management.shutdown_deadline_secs = v;
		}
		Ok(())
	}
}

impl HealthConfig {
	pub fn probe_interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}
	pub fn probe_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

impl ManagementConfig {
	pub fn shutdown_deadline(&self) -> Duration {
		Duration::from_secs(self.shutdown_deadline_secs)
	}
}

/// Reads and parses an environment variable, returning `None` when unset and an error when set
/// but unparsable, so a typo surfaces at startup rather than silently falling back to a default.
fn parse<T: FromStr>(env_var: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match env::var(env_var) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: T::Err| anyhow::anyhow!("invalid env var {env_var}={val} ({e})")),
		Err(_) => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_fill_in_when_sections_are_omitted() {
		let config = Config::from_yaml("frontend: {}\n").unwrap();
		assert_eq!(config.frontend.http.bind_addr, "0.0.0.0:8080");
		assert_eq!(config.health.healthy_threshold, 2);
	}

	#[test]
	fn unknown_top_level_field_is_rejected() {
		let err = Config::from_yaml("nonsense_field: true\n").unwrap_err();
		assert!(err.to_string().contains("nonsense_field") || err.to_string().to_lowercase().contains("unknown field"));
	}

	#[test]
	fn route_rules_parse_with_metadata_and_rate_limit_override() {
		let yaml = r#"
router:
  rules:
    - id: users
      path: /api/users/:id
      service: users-svc
      metadata:
        grpc:
          enable_transcoding: true
      rate_limit:
        requests_per_second: 5.0
        burst: 10
"#;
		let config = Config::from_yaml(yaml).unwrap();
		let rule = &config.router.rules[0];
		assert_eq!(rule.service, "users-svc");
		assert_eq!(rule.rate_limit.as_ref().unwrap().burst, 10);
	}

	#[test]
	fn session_affinity_and_balancer_policy_parse() {
		let yaml = r#"
balancer:
  policy: smooth_wrr
router:
  rules:
    - id: cart
      path: /api/cart
      service: cart-svc
      session_affinity:
        source: cookie
        name: sid
"#;
		let config = Config::from_yaml(yaml).unwrap();
		assert_eq!(config.balancer.policy, "smooth_wrr");
		let affinity = config.router.rules[0].session_affinity.as_ref().unwrap();
		assert_eq!(affinity.source, "cookie");
		assert_eq!(affinity.name, "sid");
		assert_eq!(config.session.capacity, 10_000);
	}

	#[test]
	fn resolve_worker_threads_accepts_plain_integers_and_percentages() {
		assert_eq!(resolve_worker_threads("4"), Some(4));
		assert_eq!(resolve_worker_threads("0"), Some(1));
		assert!(resolve_worker_threads("50%").unwrap() >= 1);
		assert_eq!(resolve_worker_threads("bogus"), None);
	}
}
