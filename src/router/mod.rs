//! Router (spec §4.3): matches a request to a route rule via a path-pattern grammar of literal
//! segments, `:param` captures, and a trailing `*`, most-specific (longest literal prefix) first,
//! ties broken by declaration order. The rule set is swapped atomically behind a single
//! reference on reload, matching the copy-on-read policy the rest of the gateway uses for the
//! registry's instance snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Method;

use crate::balancer::LoadBalancer;
use crate::error::GatewayError;
use crate::registry::{Registry, ServiceInstance};
use crate::request::Request;

#[derive(Debug, Clone, Default)]
pub struct RouteMetadata(pub HashMap<String, serde_json::Value>);

impl RouteMetadata {
	pub fn grpc_transcoding_enabled(&self) -> bool {
		self
			.0
			.get("grpc")
			.and_then(|v| v.get("enable_transcoding"))
			.and_then(|v| v.as_bool())
			.unwrap_or(false)
	}
}

#[derive(Debug, Clone)]
pub struct RateLimitOverride {
	pub requests_per_second: f64,
	pub burst: u32,
}

#[derive(Clone)]
pub struct RouteRule {
	pub id: String,
	pub pattern: Pattern,
	pub methods: Vec<Method>,
	pub service_name: String,
	pub timeout: Option<std::time::Duration>,
	pub retries: Option<u8>,
	pub metadata: RouteMetadata,
	pub session_affinity: Option<crate::balancer::sticky::SessionSource>,
	pub rate_limit: Option<RateLimitOverride>,
}

impl RouteRule {
	pub fn matches_method(&self, method: &Method) -> bool {
		self.methods.is_empty() || self.methods.iter().any(|m| m == method)
	}
}

#[derive(Debug, Clone)]
pub enum Segment {
	Literal(String),
	Param(String),
	Wildcard,
}

/// A compiled path pattern: literal segments match exactly, `:name` binds one path segment,
/// a trailing `*` consumes the remainder of the path including slashes.
#[derive(Debug, Clone)]
pub struct Pattern {
	raw: String,
	segments: Vec<Segment>,
}

impl Pattern {
	pub fn parse(raw: &str) -> Self {
		let segments = raw
			.trim_matches('/')
			.split('/')
			.filter(|s| !s.is_empty())
			.map(|s| {
				if s == "*" {
					Segment::Wildcard
				} else if let Some(name) = s.strip_prefix(':') {
					Segment::Param(name.to_string())
				} else {
					Segment::Literal(s.to_string())
				}
			})
			.collect();
		Self { raw: raw.to_string(), segments }
	}

	/// Count of leading literal segments, used to rank rule specificity.
	pub fn literal_prefix_len(&self) -> usize {
		self.segments.iter().take_while(|s| matches!(s, Segment::Literal(_))).count()
	}

	pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
		let path_segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
		let mut params = HashMap::new();
		let mut pi = 0usize;
		for (si, seg) in self.segments.iter().enumerate() {
			match seg {
				Segment::Wildcard => {
					// Must be the trailing segment; consumes the rest (possibly empty).
					let rest = path_segments.get(pi..).unwrap_or(&[]).join("/");
					params.insert("*".to_string(), rest);
					return Some(params);
				},
				Segment::Literal(lit) => {
					let Some(actual) = path_segments.get(pi) else { return None };
					if actual != lit {
						return None;
					}
					pi += 1;
				},
				Segment::Param(name) => {
					let Some(actual) = path_segments.get(pi) else { return None };
					params.insert(name.clone(), actual.to_string());
					pi += 1;
				},
			}
			let _ = si;
		}
		if pi == path_segments.len() { Some(params) } else { None }
	}
}

#[derive(Clone)]
pub struct RouteResult {
	pub rule: Arc<RouteRule>,
	pub instance: Arc<ServiceInstance>,
	pub service_name: String,
	pub params: HashMap<String, String>,
}

struct RuleSet {
	rules: Vec<Arc<RouteRule>>,
}

impl RuleSet {
	/// Rules are indexed by literal-prefix length at match time (longer prefixes win); ties keep
	/// the original declaration order via a stable sort.
	fn ranked(rules: Vec<Arc<RouteRule>>) -> Self {
		let mut indexed: Vec<(usize, usize, Arc<RouteRule>)> = rules
			.into_iter()
			.enumerate()
			.map(|(i, r)| (r.pattern.literal_prefix_len(), i, r))
			.collect();
		indexed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
		Self { rules: indexed.into_iter().map(|(_, _, r)| r).collect() }
	}
}

pub struct Router {
	rules: ArcSwap<RuleSet>,
	balancers: HashMap<String, Arc<dyn LoadBalancer>>,
	registry: Arc<dyn Registry>,
}

impl Router {
	pub fn new(registry: Arc<dyn Registry>, balancers: HashMap<String, Arc<dyn LoadBalancer>>) -> Self {
		Self {
			rules: ArcSwap::new(Arc::new(RuleSet { rules: Vec::new() })),
			balancers,
			registry,
		}
	}

	/// Atomically replaces the whole rule set. In-flight `route` calls either see the old set in
	/// full or the new one in full, never a partial mix.
	pub fn reload(&self, rules: Vec<RouteRule>) {
		let rules = rules.into_iter().map(Arc::new).collect();
		self.rules.store(Arc::new(RuleSet::ranked(rules)));
	}

	/// Resolves only the matching rule, without selecting an instance. Used by middleware that
	/// needs a route's configuration (e.g. its rate-limit override) ahead of the `Routing` layer,
	/// which runs after `RateLimit` in the declared composition order (spec §4.6) and is the one
	/// that actually calls the load balancer.
	pub fn match_rule(&self, request: &Request) -> Option<Arc<RouteRule>> {
		let path = request.uri().path();
		let rule_set = self.rules.load();
		rule_set
			.rules
			.iter()
			.find(|rule| rule.matches_method(request.method()) && rule.pattern.matches(path).is_some())
			.cloned()
	}

	pub fn route(&self, request: &Request) -> Result<RouteResult, GatewayError> {
		let path = request.uri().path();
		let rule_set = self.rules.load();
		for rule in rule_set.rules.iter() {
			if !rule.matches_method(request.method()) {
				continue;
			}
			let Some(params) = rule.pattern.matches(path) else { continue };

			let balancer = self
				.balancers
				.get(&rule.service_name)
				.cloned()
				.unwrap_or_else(|| crate::balancer::build(crate::balancer::Policy::WeightedRandom));
			let snapshot = self.registry.get_instances(&rule.service_name);
			let instance = balancer
				.select(&snapshot, request)
				.map_err(|_| GatewayError::unavailable(format!("no healthy instance for service '{}'", rule.service_name)))?;

			return Ok(RouteResult {
				rule: rule.clone(),
				instance,
				service_name: rule.service_name.clone(),
				params,
			});
		}
		Err(GatewayError::not_found(format!("no route matches {} {}", request.method(), path)))
	}
}

#[cfg(test)]
mod route_test {
	use super::*;

	#[test]
	fn literal_beats_param_beats_wildcard() {
		let users = Pattern::parse("/api/users");
		let param = Pattern::parse("/api/:id");
		let wildcard = Pattern::parse("/api/*");
		assert!(users.literal_prefix_len() > param.literal_prefix_len());
		assert!(param.literal_prefix_len() >= wildcard.literal_prefix_len());
	}

	#[test]
	fn param_binds_segment() {
		let pattern = Pattern::parse("/api/:id/edit");
		let params = pattern.matches("/api/42/edit").unwrap();
		assert_eq!(params.get("id"), Some(&"42".to_string()));
		assert!(pattern.matches("/api/42/edit/extra").is_none());
	}

	#[test]
	fn wildcard_consumes_remainder() {
		let pattern = Pattern::parse("/static/*");
		let params = pattern.matches("/static/css/app.css").unwrap();
		assert_eq!(params.get("*"), Some(&"css/app.css".to_string()));
	}

	#[test]
	fn ranking_orders_longest_literal_prefix_first() {
		let rules = vec![
			RouteRule {
				id: "wild".into(),
				pattern: Pattern::parse("/api/*"),
				methods: vec![],
				service_name: "catchall".into(),
				timeout: None,
				retries: None,
				metadata: RouteMetadata::default(),
				session_affinity: None,
				rate_limit: None,
			},
			RouteRule {
				id: "exact".into(),
				pattern: Pattern::parse("/api/users"),
				methods: vec![],
				service_name: "users".into(),
				timeout: None,
				retries: None,
				metadata: RouteMetadata::default(),
				session_affinity: None,
				rate_limit: None,
			},
		];
		let ranked = RuleSet::ranked(rules.into_iter().map(Arc::new).collect());
		assert_eq!(ranked.rules[0].id, "exact");
		assert_eq!(ranked.rules[1].id, "wild");
	}
}
