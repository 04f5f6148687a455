//! Application wiring (spec §4.6, §6, `SPEC_FULL.md` §10.3): turns a typed `Config` into the
//! fully assembled axum routers, middleware chain, health monitor, session store, and gRPC
//! connection pool a running gateway process needs, plus the `Server` that binds listeners and
//! sequences graceful shutdown. Grounded on the teacher's `crates/agentgateway/src/app.rs` (`run`,
//! bound listeners, graceful shutdown sequencing via `gateway_core::{drain,signal,readiness}`),
//! simplified: this gateway has no separate control-plane/data-plane runtime split to justify a
//! dedicated second tokio runtime, so everything here runs on the caller's runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Method, StatusCode, Uri};
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::Mutex as PLMutex;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry as MetricsRegistry;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::apikey::{ApiKeyProvider, KeyConfig};
use crate::auth::jwt::{Audience, JwtProvider};
use crate::auth::{AuthInfo, AuthPipeline, Extractor, Provider, SubjectType};
use crate::balancer::sticky::{SessionSource, StickySession};
use crate::balancer::{self, LoadBalancer, Policy};
use crate::config::Config;
use crate::connectors::grpc::GrpcConnector;
use crate::connectors::http::HttpConnector;
use crate::connectors::sse::SSEConnector;
use crate::connectors::websocket::{self, ConnectionGate, OriginPolicy};
use crate::descriptor::{DescriptorRegistry, DynamicTranscoder};
use crate::error::GatewayError;
use crate::management;
use crate::middleware::auth::Auth;
use crate::middleware::authz::Authz;
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::middleware::forward::Connectors;
use crate::middleware::metrics::Metrics;
use crate::middleware::oauth2::OAuth2;
use crate::middleware::rate_limit::{RateLimit, RateLimitConfig, Selector};
use crate::middleware::recovery::Recovery;
use crate::middleware::retry::{Retry, RetryPolicy};
use crate::middleware::routing::Routing;
use crate::middleware::telemetry::Telemetry;
use crate::middleware::{Chain, Middleware, Next};
use crate::registry::health::{HealthCheck, HealthCheckConfig, HealthMonitor};
use crate::registry::{Registry as ServiceRegistry, Scheme, ServiceInstance, StaticRegistry};
use crate::request::{Body, Request, RequestContext, Response};
use crate::router::{RateLimitOverride, RouteResult, RouteRule, Router};
use crate::session::SessionStore;

type AxumResponse = axum::response::Response;
type BackendWsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------------------------
// Config -> domain factories
// ---------------------------------------------------------------------------------------------

fn build_registry(config: &Config) -> Arc<StaticRegistry> {
	let mut services = HashMap::new();
	for (name, instances) in &config.registry.services {
		let built: Vec<ServiceInstance> = instances
			.iter()
			.map(|inst| {
				let mut metadata = inst.metadata.clone();
				if let Some(weight) = inst.weight {
					metadata.entry("weight".to_string()).or_insert_with(|| weight.to_string());
				}
				ServiceInstance::new(inst.id.clone(), inst.address.clone(), inst.port, inst.scheme).with_metadata(metadata)
			})
			.collect();
		services.insert(name.clone(), built);
	}
	Arc::new(StaticRegistry::from_config(services))
}

fn parse_session_source(affinity: &crate::config::SessionAffinityConfig) -> Option<SessionSource> {
	match affinity.source.as_str() {
		"cookie" => Some(SessionSource::Cookie(affinity.name.clone())),
		"header" => Some(SessionSource::Header(affinity.name.clone())),
		"query" => Some(SessionSource::Query(affinity.name.clone())),
		_ => None,
	}
}

fn build_route_rules(config: &Config) -> Vec<RouteRule> {
	config
		.router
		.rules
		.iter()
		.map(|rule_cfg| {
			let methods = rule_cfg.methods.iter().filter_map(|m| Method::from_bytes(m.as_bytes()).ok()).collect();
			RouteRule {
				id: rule_cfg.id.clone(),
				pattern: crate::router::Pattern::parse(&rule_cfg.path),
				methods,
				service_name: rule_cfg.service.clone(),
				timeout: rule_cfg.timeout_secs.map(Duration::from_secs),
				retries: rule_cfg.retries,
				metadata: crate::router::RouteMetadata(rule_cfg.metadata.clone()),
				session_affinity: rule_cfg.session_affinity.as_ref().and_then(parse_session_source),
				rate_limit: rule_cfg.rate_limit.as_ref().map(|r| RateLimitOverride { requests_per_second: r.requests_per_second, burst: r.burst }),
			}
		})
		.collect()
}

fn parse_policy(policy: &str) -> Policy {
	match policy {
		"smooth_wrr" => Policy::SmoothWeightedRoundRobin,
		_ => Policy::WeightedRandom,
	}
}

/// One balancer per configured service; wrapped in `StickySession` when any route targeting that
/// service configures session affinity (spec §4.2/§4.3).
fn build_balancers(config: &Config, rules: &[RouteRule], session_store: &Arc<SessionStore>) -> HashMap<String, Arc<dyn LoadBalancer>> {
	let policy = parse_policy(&config.balancer.policy);
	let ttl = Duration::from_secs(config.session.ttl_secs);
	config
		.registry
		.services
		.keys()
		.map(|service_name| {
			let base = balancer::build(policy);
			let affinity = rules.iter().filter(|r| &r.service_name == service_name).find_map(|r| r.session_affinity.clone());
			let lb: Arc<dyn LoadBalancer> = match affinity {
				Some(source) => Arc::new(StickySession::new(base, session_store.clone(), source, ttl)),
				None => base,
			};
			(service_name.clone(), lb)
		})
		.collect()
}

fn build_decoding_key(jwt_cfg: &crate::config::JwtProviderConfig, algorithm: Algorithm) -> anyhow::Result<DecodingKey> {
	let inline = jwt_cfg.inline_key.as_ref().ok_or_else(|| anyhow::anyhow!("jwt provider requires either jwks_url or inline_key"))?;
	let key = match algorithm {
		Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => DecodingKey::from_secret(inline.as_bytes()),
		Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => DecodingKey::from_rsa_pem(inline.as_bytes())?,
		Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(inline.as_bytes())?,
		other => anyhow::bail!("unsupported JWT algorithm {other:?} for an inline key"),
	};
	Ok(key)
}

fn build_jwt_provider(jwt_cfg: &crate::config::JwtProviderConfig) -> anyhow::Result<JwtProvider> {
	let algorithm = crate::auth::jwt::parse_algorithm(&jwt_cfg.algorithm).ok_or_else(|| anyhow::anyhow!("unknown JWT algorithm '{}'", jwt_cfg.algorithm))?;

	let mut provider = if let Some(url) = &jwt_cfg.jwks_url {
		let ttl = Duration::from_secs(jwt_cfg.jwks_ttl_secs.unwrap_or(300));
		JwtProvider::jwks(url.clone(), ttl)
	} else {
		JwtProvider::inline(build_decoding_key(jwt_cfg, algorithm)?, algorithm)
	};

	if let Some(issuer) = &jwt_cfg.issuer {
		provider = provider.with_issuer(issuer.clone());
	}
	if !jwt_cfg.audience.is_empty() {
		let audience = if jwt_cfg.audience.len() == 1 { Audience::Single(jwt_cfg.audience[0].clone()) } else { Audience::Many(jwt_cfg.audience.clone()) };
		provider = provider.with_audience(audience);
	}
	if let Some(claim) = &jwt_cfg.subject_claim {
		provider = provider.with_subject_claim(claim.clone());
	}
	if let Some(claim) = &jwt_cfg.scope_claim {
		provider = provider.with_scope_claim(claim.clone());
	}
	Ok(provider)
}

fn build_api_key_provider(api_key_cfg: &crate::config::ApiKeyProviderConfig) -> ApiKeyProvider {
	let keys = api_key_cfg
		.keys
		.iter()
		.map(|(presented, entry)| {
			let subject_type = match entry.subject_type.as_deref() {
				Some("service") => SubjectType::Service,
				Some("device") => SubjectType::Device,
				_ => SubjectType::User,
			};
			(presented.clone(), KeyConfig { subject: entry.subject.clone(), subject_type, scopes: entry.scopes.clone(), disabled: entry.disabled, expires_at: None })
		})
		.collect();
	ApiKeyProvider::new(keys, api_key_cfg.hashed, api_key_cfg.default_scopes.clone())
}

/// Binds an `Authorization: Bearer` extractor to a configured JWT provider and an `X-API-Key`
/// header extractor to a configured API-key provider (spec §4.5); either, both, or neither may be
/// configured.
fn build_auth_pipeline(auth_cfg: &crate::config::AuthConfig) -> anyhow::Result<AuthPipeline> {
	let mut extractors = Vec::new();
	let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

	if let Some(jwt_cfg) = &auth_cfg.jwt {
		extractors.push(Extractor::AuthorizationBearer);
		providers.push(Arc::new(build_jwt_provider(jwt_cfg)?));
	}
	if let Some(api_key_cfg) = &auth_cfg.api_key {
		extractors.push(Extractor::Header("x-api-key".to_string()));
		providers.push(Arc::new(build_api_key_provider(api_key_cfg)));
	}

	Ok(AuthPipeline::new(extractors, providers).with_skip_paths(auth_cfg.skip_paths.clone()).with_required_scopes(auth_cfg.required_scopes.clone()).with_required(auth_cfg.required))
}

fn build_circuit_breaker_config(cfg: Option<&crate::config::CircuitBreakerConfig>) -> CircuitBreakerConfig {
	let defaults = CircuitBreakerConfig::default();
	match cfg {
		Some(cfg) => CircuitBreakerConfig {
			failure_threshold: cfg.failure_threshold.unwrap_or(defaults.failure_threshold),
			open_duration: cfg.open_duration_secs.map(Duration::from_secs).unwrap_or(defaults.open_duration),
			half_open_success_threshold: cfg.half_open_success_threshold.unwrap_or(defaults.half_open_success_threshold),
		},
		None => defaults,
	}
}

fn build_retry_policy(cfg: Option<&crate::config::RetryConfig>) -> RetryPolicy {
	let defaults = RetryPolicy::default();
	match cfg {
		Some(cfg) => RetryPolicy { attempts: cfg.attempts.unwrap_or(defaults.attempts), backoff: cfg.backoff_ms.map(Duration::from_millis).unwrap_or(defaults.backoff) },
		None => defaults,
	}
}

fn parse_selector(s: &str) -> Selector {
	match s {
		"subject" => Selector::Subject,
		"route" => Selector::Route,
		_ => Selector::RemoteAddr,
	}
}

fn build_rate_limit(cfg: &crate::config::RateLimitConfig, router: Arc<Router>) -> RateLimit {
	RateLimit::new(parse_selector(&cfg.selector), RateLimitConfig { requests_per_second: cfg.requests_per_second, burst: cfg.burst }, router)
}

// ---------------------------------------------------------------------------------------------
// Middleware chain assembly
// ---------------------------------------------------------------------------------------------

/// Builds the chain's layers in the fixed composition order from spec §4.6:
/// `Recovery -> Metrics -> Telemetry -> CircuitBreaker -> Retry -> [Auth] -> OAuth2 -> [Authz] ->
/// [RateLimit] -> Routing`. `CircuitBreaker`/`Retry` are structural and always present (falling
/// back to their type's `Default` when unconfigured); `Auth`/`RateLimit` are present only when
/// configured; `Authz` is gated on `config.middleware.authz_enabled` (off by default, since
/// per-route scope enforcement needs routes to carry an `authz` metadata block to mean anything).
/// The same layer list is shared by the HTTP and WebSocket frontends so circuit-breaker state and
/// rate-limit buckets are consistent across both (see `ws_routing_terminal`).
fn build_middleware_layers(config: &Config, router: Arc<Router>, metrics_registry: &mut MetricsRegistry) -> anyhow::Result<Vec<Arc<dyn Middleware>>> {
	let mut layers: Vec<Arc<dyn Middleware>> = Vec::new();
	layers.push(Arc::new(Recovery));
	layers.push(Arc::new(Metrics::new(metrics_registry)));
	layers.push(Arc::new(Telemetry));

	let circuit_breaker_config = build_circuit_breaker_config(config.circuit_breaker.as_ref());
	let cb_router = router.clone();
	layers.push(Arc::new(CircuitBreaker::new(circuit_breaker_config, move |req: &Request| {
		// Routing hasn't run yet at this point in the chain, so the breaker keys on the matched
		// rule's service name (resolved the same way Authz/RateLimit do below) rather than the
		// service+instance pair spec §4.6 describes; instance-level keying would need the load
		// balancer's own selection, which only `Routing` performs.
		cb_router.match_rule(req).map(|r| r.service_name.clone()).unwrap_or_else(|| "unrouted".to_string())
	})));

	layers.push(Arc::new(Retry::new(build_retry_policy(config.retry.as_ref()))));

	if let Some(auth_cfg) = &config.auth {
		layers.push(Arc::new(Auth::new(build_auth_pipeline(auth_cfg)?)));
	}

	layers.push(Arc::new(OAuth2::passthrough()));

	if config.middleware.authz_enabled {
		layers.push(Arc::new(Authz::new(router.clone())));
	}

	if let Some(rate_limit_cfg) = &config.rate_limit {
		layers.push(Arc::new(build_rate_limit(rate_limit_cfg, router.clone())));
	}

	layers.push(Arc::new(Routing::new(router)));

	Ok(layers)
}

/// The WebSocket frontend's chain terminal: instead of dispatching to `Connectors` (which rejects
/// `Ws`/`Wss` instances, see `middleware::forward`), it copies the `RouteResult` that `Routing`
/// just memoized — and the `AuthInfo` `Auth` may have attached — onto the *response*'s extensions,
/// so `ws_upgrade_handler` can read the routing decision back out after `Chain::run` returns
/// without any shared mutable state between concurrent upgrades.
fn ws_routing_terminal() -> Next {
	Arc::new(|req: Request| {
		Box::pin(async move {
			let route = req.extensions().get::<RouteResult>().cloned().ok_or_else(|| GatewayError::internal("websocket routing reached terminal without a memoized route result"))?;
			let auth_info = req.extensions().get::<AuthInfo>().cloned();
			let mut resp = http::Response::builder().status(StatusCode::OK).body(Body::empty()).map_err(|e| GatewayError::internal("failed to build websocket routing response").with_source(e))?;
			resp.extensions_mut().insert(route);
			if let Some(info) = auth_info {
				resp.extensions_mut().insert(info);
			}
			Ok(resp)
		})
	})
}

// ---------------------------------------------------------------------------------------------
// HTTP frontend
// ---------------------------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
	chain: Arc<Chain>,
}

async fn proxy_handler(State(state): State<HttpState>, ConnectInfo(remote_addr): ConnectInfo<SocketAddr>, mut req: Request) -> Result<Response, GatewayError> {
	if crate::connectors::grpc::is_grpc_web(req.headers()) {
		if let Some(resp) = crate::connectors::grpc::grpc_web_preflight_response(req.method()) {
			return Ok(resp);
		}
	}
	req.extensions_mut().insert(RequestContext::new(Some(remote_addr)));
	state.chain.run(req).await
}

fn build_http_router(state: HttpState, management_router: Option<axum::Router>, cors: Option<&crate::config::CorsConfig>, max_body_bytes: u64) -> axum::Router {
	let mut router = axum::Router::new().fallback(proxy_handler).with_state(state);
	if let Some(mgmt) = management_router {
		router = router.merge(mgmt);
	}
	if let Some(cors_cfg) = cors {
		router = router.layer(build_cors_layer(cors_cfg));
	}
	router.layer(RequestBodyLimitLayer::new(max_body_bytes as usize)).layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer(cors_cfg: &crate::config::CorsConfig) -> tower_http::cors::CorsLayer {
	use tower_http::cors::{Any, CorsLayer};
	if cors_cfg.allowed_origins.iter().any(|o| o == "*") {
		return CorsLayer::permissive();
	}
	let origins: Vec<http::HeaderValue> = cors_cfg.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
	CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
}

// ---------------------------------------------------------------------------------------------
// WebSocket frontend
// ---------------------------------------------------------------------------------------------

#[derive(Clone)]
struct WsState {
	chain: Arc<Chain>,
	gate: Arc<ConnectionGate>,
	origin_policy: Arc<OriginPolicy>,
	subprotocols: Arc<Vec<String>>,
	active_connections: Gauge,
}

async fn ws_upgrade_handler(
	State(state): State<WsState>,
	method: Method,
	uri: Uri,
	headers: HeaderMap,
	ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
	ws: WebSocketUpgrade,
) -> Result<AxumResponse, GatewayError> {
	let origin = headers.get(http::header::ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_string);
	let host = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
	if !websocket::check_origin(&state.origin_policy, origin.as_deref(), &host, websocket::default_port_for_scheme) {
		return Err(GatewayError::forbidden("websocket origin not allowed"));
	}

	let Some(ticket) = state.gate.try_acquire() else {
		return Err(GatewayError::unavailable("too many concurrent websocket connections"));
	};

	let mut synthetic = http::Request::builder().method(method).uri(uri.clone());
	if let Some(hs) = synthetic.headers_mut() {
		*hs = headers.clone();
	}
	let mut synthetic = synthetic.body(Body::empty()).map_err(|e| GatewayError::internal("failed to build websocket routing request").with_source(e))?;
	synthetic.extensions_mut().insert(RequestContext::new(Some(remote_addr)));

	let routed = state.chain.run(synthetic).await?;
	let route = routed.extensions().get::<RouteResult>().cloned().ok_or_else(|| GatewayError::internal("websocket routing produced no route result"))?;
	if !matches!(route.instance.scheme, Scheme::Ws | Scheme::Wss) {
		return Err(GatewayError::bad_request("matched route does not target a websocket backend"));
	}
	let auth_info = routed.extensions().get::<AuthInfo>().cloned();

	let path_and_query = uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
	let backend = websocket::dial_backend(&route.instance, &path_and_query, headers, Some(remote_addr)).await?;

	let mut upgrade = ws;
	if !state.subprotocols.is_empty() {
		upgrade = upgrade.protocols((*state.subprotocols).clone());
	}

	let active_connections = state.active_connections.clone();
	active_connections.inc();
	Ok(upgrade
		.on_upgrade(move |socket| async move {
			run_proxy_session(socket, backend, auth_info, ticket).await;
			active_connections.dec();
		})
		.into_response())
}

/// Bridges the upgraded frontend socket and the dialed backend socket until either closes, or
/// (spec §4.4.4) until the authenticated token's expiry is reached, in which case a close frame
/// 1000 "authentication expired" is sent and the session ends. Written as its own select loop
/// rather than reusing `connectors::websocket::shuttle` because that helper has exactly two
/// branches (frontend, backend) with no room for a third "timer fired" branch, and because the
/// frontend half here is an axum `WebSocket`, not a `tokio-tungstenite` stream — requiring the
/// message-type bridging functions below regardless.
async fn run_proxy_session(socket: WebSocket, backend: BackendWsStream, auth_info: Option<AuthInfo>, _ticket: websocket::GateTicket) {
	let (mut frontend_sink, mut frontend_stream) = socket.split();
	let (mut backend_sink, mut backend_stream) = backend.split();

	// A token with no expiry (or no auth at all) never fires; an effectively-infinite duration
	// keeps the `select!` loop free of `Option<Sleep>` bookkeeping.
	let ten_years = Duration::from_secs(60 * 60 * 24 * 365 * 10);
	let delay = auth_info
		.as_ref()
		.and_then(|info| info.expires_at)
		.and_then(|exp| exp.checked_sub(Duration::from_secs(5)))
		.and_then(|fire_at| fire_at.duration_since(SystemTime::now()).ok())
		.unwrap_or(ten_years);
	let sleep = tokio::time::sleep(delay);
	tokio::pin!(sleep);

	loop {
		tokio::select! {
			_ = &mut sleep => {
				let _ = frontend_sink
					.send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame { code: 1000, reason: "authentication expired".into() })))
					.await;
				return;
			}
			msg = frontend_stream.next() => {
				match msg {
					Some(Ok(msg)) => {
						let is_close = matches!(msg, AxumMessage::Close(_));
						if backend_sink.send(axum_to_tungstenite(msg)).await.is_err() {
							return;
						}
						if is_close {
							return;
						}
					}
					_ => return,
				}
			}
			msg = backend_stream.next() => {
				match msg {
					Some(Ok(msg)) => {
						let is_close = matches!(msg, TungsteniteMessage::Close(_));
						if frontend_sink.send(tungstenite_to_axum(msg)).await.is_err() {
							return;
						}
						if is_close {
							return;
						}
					}
					_ => return,
				}
			}
		}
	}
}

/// Mirrors `connectors::websocket`'s own `From<TungsteniteMessage> for WebSocketMessage`, which
/// maps tungstenite's raw `Frame` variant (no axum equivalent) to an empty binary message rather
/// than failing; conversions use generic `.to_string()`/`.to_vec()`/`.into()` rather than naming
/// the exact `Bytes`/`Utf8Bytes` types, since axum and tokio-tungstenite each define their own.
fn axum_to_tungstenite(msg: AxumMessage) -> TungsteniteMessage {
	match msg {
		AxumMessage::Text(t) => TungsteniteMessage::Text(t.to_string().into()),
		AxumMessage::Binary(b) => TungsteniteMessage::Binary(b.to_vec().into()),
		AxumMessage::Ping(p) => TungsteniteMessage::Ping(p.to_vec().into()),
		AxumMessage::Pong(p) => TungsteniteMessage::Pong(p.to_vec().into()),
		AxumMessage::Close(frame) => TungsteniteMessage::Close(frame.map(|f| tokio_tungstenite::tungstenite::protocol::CloseFrame { code: f.code.into(), reason: f.reason.to_string().into() })),
	}
}

fn tungstenite_to_axum(msg: TungsteniteMessage) -> AxumMessage {
	match msg {
		TungsteniteMessage::Text(t) => AxumMessage::Text(t.to_string().into()),
		TungsteniteMessage::Binary(b) => AxumMessage::Binary(b.to_vec().into()),
		TungsteniteMessage::Ping(p) => AxumMessage::Ping(p.to_vec().into()),
		TungsteniteMessage::Pong(p) => AxumMessage::Pong(p.to_vec().into()),
		TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(|f| axum::extract::ws::CloseFrame { code: f.code.into(), reason: f.reason.to_string().into() })),
		TungsteniteMessage::Frame(_) => AxumMessage::Binary(Vec::new().into()),
	}
}

// ---------------------------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------------------------

fn parse_bind_addr(raw: &str, label: &str) -> anyhow::Result<SocketAddr> {
	raw.parse().map_err(|e| anyhow::anyhow!("invalid {label} bind address '{raw}': {e}"))
}

/// Everything a running gateway process needs: the bound routers, the background components that
/// outlive any single request (health monitor, session sweeper, gRPC connection pool), and the
/// shutdown deadline. Built once from a `Config` by `Server::build`, then consumed by `Server::run`.
pub struct Server {
	http_addr: SocketAddr,
	http_router: axum::Router,
	ws_addr: SocketAddr,
	ws_router: axum::Router,
	management: Option<(SocketAddr, axum::Router)>,
	health_monitor: Arc<HealthMonitor>,
	session_store: Arc<SessionStore>,
	grpc_connector: Arc<GrpcConnector>,
	shutdown_deadline: Duration,
	ready: gateway_core::readiness::Ready,
}

impl Server {
	pub fn build(config: Config) -> anyhow::Result<Self> {
		let registry = build_registry(&config);
		let registry_dyn: Arc<dyn ServiceRegistry> = registry.clone();

		let session_store = SessionStore::new(config.session.capacity);
		let route_rules = build_route_rules(&config);
		let balancers = build_balancers(&config, &route_rules, &session_store);
		let router = Arc::new(Router::new(registry_dyn.clone(), balancers));
		router.reload(route_rules);

		let health_monitor = HealthMonitor::new(HealthCheckConfig {
			check: HealthCheck::Tcp,
			interval: config.health.probe_interval(),
			timeout: config.health.probe_timeout(),
			healthy_threshold: config.health.healthy_threshold,
			unhealthy_threshold: config.health.unhealthy_threshold,
		});
		for service_name in registry_dyn.service_names() {
			health_monitor.watch(registry_dyn.clone(), service_name);
		}

		let descriptors = DescriptorRegistry::new();
		let transcoder = Arc::new(DynamicTranscoder::new(descriptors.clone()));
		let grpc_connector = Arc::new(
			GrpcConnector::new(descriptors, transcoder)
				.with_keepalive(Duration::from_secs(config.backend.grpc.keepalive_time_secs), Duration::from_secs(config.backend.grpc.keepalive_timeout_secs)),
		);
		let http_connector = Arc::new(HttpConnector::new(Duration::from_secs(config.backend.http.default_timeout_secs)));
		let sse_connector = Arc::new(SSEConnector::new());
		let connectors = Arc::new(Connectors { http: http_connector, grpc: grpc_connector.clone(), sse: sse_connector });

		let mut metrics_registry = MetricsRegistry::default();
		let layers = build_middleware_layers(&config, router.clone(), &mut metrics_registry)?;
		let active_connections: Gauge = Gauge::default();
		metrics_registry.register("gateway_active_connections", "Open WebSocket connections", active_connections.clone());
		let metrics_registry = Arc::new(PLMutex::new(metrics_registry));

		let http_chain = Arc::new(Chain::new(layers.clone(), connectors.dispatch()));
		let ws_chain = Arc::new(Chain::new(layers, ws_routing_terminal()));

		let http_addr = parse_bind_addr(&config.frontend.http.bind_addr, "HTTP")?;
		let ws_addr = parse_bind_addr(&config.frontend.websocket.bind_addr, "WebSocket")?;

		let management_merged = config.management.bind_addr.is_none();
		let management_router = management::router(metrics_registry.clone(), config.management.health_aliases);
		let http_management = if management_merged { Some(management_router) } else { None };

		let http_state = HttpState { chain: http_chain };
		let http_router = build_http_router(http_state, http_management, config.cors.as_ref(), config.frontend.http.max_request_size_bytes);

		let origin_policy =
			if config.backend.websocket.origin_allow_list.is_empty() { OriginPolicy::Disabled } else { OriginPolicy::AllowList(config.backend.websocket.origin_allow_list.clone()) };
		let ws_state =
			WsState { chain: ws_chain, gate: Arc::new(ConnectionGate::new(config.frontend.websocket.max_connections)), origin_policy: Arc::new(origin_policy), subprotocols: Arc::new(config.frontend.websocket.subprotocols.clone()), active_connections };
		let ws_router = axum::Router::new().route("/{*path}", any(ws_upgrade_handler)).with_state(ws_state).layer(tower_http::trace::TraceLayer::new_for_http());

		let management = if management_merged {
			None
		} else {
			let addr = parse_bind_addr(config.management.bind_addr.as_deref().expect("checked above"), "management")?;
			Some((addr, management::router(metrics_registry, config.management.health_aliases)))
		};

		Ok(Self { http_addr, http_router, ws_addr, ws_router, management, health_monitor, session_store, grpc_connector, shutdown_deadline: config.management.shutdown_deadline(), ready: gateway_core::readiness::Ready::new() })
	}

	/// Binds every listener, serves until a termination signal arrives, then drains connections
	/// within `shutdown_deadline` before stopping the background components and returning.
	pub async fn run(self) -> anyhow::Result<()> {
		let (drain_trigger, drain_watcher) = gateway_core::drain::new();

		let http_ready = self.ready.register_task("http-listener");
		let http_listener = TcpListener::bind(self.http_addr).await?;
		drop(http_ready);
		let http_task = spawn_server(http_listener, self.http_router, drain_watcher.clone());

		let ws_ready = self.ready.register_task("websocket-listener");
		let ws_listener = TcpListener::bind(self.ws_addr).await?;
		drop(ws_ready);
		let ws_task = spawn_server(ws_listener, self.ws_router, drain_watcher.clone());

		let management_task = match self.management {
			Some((addr, router)) => {
				let mgmt_ready = self.ready.register_task("management-listener");
				let listener = TcpListener::bind(addr).await?;
				drop(mgmt_ready);
				Some(spawn_server(listener, router, drain_watcher.clone()))
			},
			None => None,
		};

		if self.ready.is_ready() {
			tracing::info!("gateway is ready");
		}
		drop(drain_watcher);

		gateway_core::signal::Shutdown::new().wait().await;
		tracing::info!("termination signal received, draining connections");

		match tokio::time::timeout(self.shutdown_deadline, drain_trigger.start_drain_and_wait(gateway_core::drain::DrainMode::Graceful)).await {
			Ok(()) => tracing::info!("all connections drained"),
			Err(_) => {
				tracing::warn!("graceful shutdown deadline elapsed, forcing remaining connections closed");
				http_task.abort();
				ws_task.abort();
				if let Some(task) = &management_task {
					task.abort();
				}
			},
		}

		self.health_monitor.stop();
		self.session_store.stop();
		self.grpc_connector.close();

		let _ = http_task.await;
		let _ = ws_task.await;
		if let Some(task) = management_task {
			let _ = task.await;
		}
		Ok(())
	}
}

/// Spawns one listener's `axum::serve` loop. `watcher` is cloned twice: one clone is awaited
/// directly to learn *when* to begin graceful shutdown, the other is held alive for the task's
/// entire lifetime via `wrap_connection` so `DrainTrigger::start_drain_and_wait` keeps waiting
/// until this listener's connections (including any upgraded WebSocket session) have actually
/// finished draining, not merely until the shutdown signal was observed.
fn spawn_server(listener: TcpListener, router: axum::Router, watcher: gateway_core::drain::DrainWatcher) -> tokio::task::JoinHandle<()> {
	let signal_watcher = watcher.clone();
	tokio::spawn(watcher.wrap_connection(async move {
		let mut signal_watcher = signal_watcher;
		let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
		if let Err(err) = axum::serve(listener, make_service).with_graceful_shutdown(async move { signal_watcher.signaled().await }).await {
			tracing::error!(error = %err, "listener exited with an error");
		}
	}))
}
