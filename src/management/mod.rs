//! Management endpoints (spec §6): a small built-in HTTP surface distinct from the proxied data
//! plane — health/echo/metrics — served on whatever address the host configures. Grounded on the
//! teacher's `crates/agentgateway/src/management/metrics_server.rs` (content-type negotiation
//! between plain-text and OpenMetrics exposition), adapted to `axum::Router` rather than the
//! teacher's raw `hyper_helpers` server wrapper since the rest of this gateway's frontend is
//! axum-based.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde_json::json;

use crate::request::RequestContext;

#[derive(Clone)]
struct ManagementState {
	registry: Arc<Mutex<Registry>>,
}

/// Builds the management router: `GET /_gateway/health`, `GET /_gateway/echo`, and (since
/// `SPEC_FULL.md` §10.5 carries Prometheus export as ambient infra regardless of the spec's
/// "management REST API" non-goal) `GET /metrics`. When `health_aliases` is set, also serves
/// `/health`, `/ready`, and `/live` as aliases of the same health handler (spec §6).
pub fn router(registry: Arc<Mutex<Registry>>, health_aliases: bool) -> axum::Router {
	let state = ManagementState { registry };
	let mut router = axum::Router::new()
		.route("/_gateway/health", get(health))
		.route("/_gateway/echo", get(echo))
		.route("/metrics", get(metrics));
	if health_aliases {
		router = router.route("/health", get(health)).route("/ready", get(health)).route("/live", get(health));
	}
	router.with_state(state)
}

async fn health() -> impl IntoResponse {
	Json(json!({
		"status": "healthy",
		"service": "gateway",
	}))
}

async fn echo(req: axum::extract::Request) -> impl IntoResponse {
	let context = req.extensions().get::<RequestContext>();
	let headers: serde_json::Map<String, serde_json::Value> = req
		.headers()
		.iter()
		.filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), json!(v))))
		.collect();

	Json(json!({
		"request_id": context.map(|c| c.id.as_str().to_string()),
		"method": req.method().to_string(),
		"path": req.uri().path(),
		"query": req.uri().query(),
		"remote_addr": context.and_then(|c| c.remote_addr).map(|a| a.to_string()),
		"headers": headers,
	}))
}

async fn metrics(State(state): State<ManagementState>, req: axum::extract::Request) -> Response {
	let mut buf = String::new();
	let registry = state.registry.lock();
	if let Err(err) = encode(&mut buf, &registry) {
		return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
	}
	drop(registry);

	let content_type = negotiate_content_type(&req);
	([(axum::http::header::CONTENT_TYPE, content_type)], buf).into_response()
}

fn negotiate_content_type(req: &axum::extract::Request) -> &'static str {
	req
		.headers()
		.get_all(axum::http::header::ACCEPT)
		.iter()
		.find_map(|v| {
			let primary = v.to_str().ok()?.to_lowercase();
			primary.split(';').next().map(str::to_string)
		})
		.filter(|primary| primary == "application/openmetrics-text")
		.map(|_| "application/openmetrics-text;charset=utf-8;version=1.0.0")
		.unwrap_or("text/plain; charset=utf-8")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_to_plain_text_without_an_accept_header() {
		let req = axum::extract::Request::new(axum::body::Body::empty());
		assert_eq!(negotiate_content_type(&req), "text/plain; charset=utf-8");
	}

	#[test]
	fn honors_openmetrics_accept_header() {
		let req = http::Request::builder()
			.header("accept", "application/openmetrics-text; version=1.0.0")
			.body(axum::body::Body::empty())
			.unwrap();
		assert_eq!(negotiate_content_type(&req), "application/openmetrics-text;charset=utf-8;version=1.0.0");
	}

	#[test]
	fn falls_back_to_plain_text_for_unsupported_accept() {
		let req = http::Request::builder().header("accept", "application/json").body(axum::body::Body::empty()).unwrap();
		assert_eq!(negotiate_content_type(&req), "text/plain; charset=utf-8");
	}
}
