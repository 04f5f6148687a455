//! Forward (spec §4.6): the chain's terminal. Reads the `RouteResult` memoized by `Routing` and
//! dispatches to whichever protocol connector matches the selected instance's scheme, mapping
//! each connector's own error taxonomy straight through (they already produce `GatewayError`).
//!
//! WebSocket instances are deliberately not dispatched here: an upgrade handshake needs the
//! frontend's own `Upgrade` extractor operating on the raw connection before a `Request`/`Response`
//! pair even exists in the usual sense, so the WS frontend in `app` wires `Routing` + a direct call
//! into `connectors::websocket` ahead of the ordinary chain and never reaches `Forward`. Reaching
//! this terminal with a `Ws`/`Wss` instance is a configuration error.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;

use super::Next;
use crate::connectors::grpc::GrpcConnector;
use crate::connectors::http::HttpConnector;
use crate::connectors::sse::{self, SSEConnector};
use crate::error::GatewayError;
use crate::registry::Scheme;
use crate::request::{Body, RequestContext, Response};
use crate::router::RouteResult;

pub struct Connectors {
	pub http: Arc<HttpConnector>,
	pub grpc: Arc<GrpcConnector>,
	pub sse: Arc<SSEConnector>,
}

impl Connectors {
	/// Builds the terminal `Next` closure for `middleware::Chain`.
	pub fn dispatch(self: Arc<Self>) -> Next {
		Arc::new(move |req| {
			let connectors = self.clone();
			Box::pin(async move { connectors.forward(req).await })
		})
	}

	async fn forward(&self, req: crate::request::Request) -> Result<Response, GatewayError> {
		let route = req
			.extensions()
			.get::<RouteResult>()
			.cloned()
			.ok_or_else(|| GatewayError::internal("forward reached without a memoized route result"))?;
		let remote_addr = req.extensions().get::<RequestContext>().and_then(|ctx| ctx.remote_addr);
		let timeout = route.rule.timeout;

		match route.instance.scheme {
			Scheme::Http | Scheme::Https if wants_sse(&req) => self.forward_sse(&route, &req).await,
			Scheme::Http | Scheme::Https => self.http.forward(&route.instance, req, remote_addr, timeout).await,
			Scheme::Grpc => {
				let transcoding = route.rule.metadata.grpc_transcoding_enabled();
				self.grpc.call(&route.instance, req, transcoding).await
			},
			Scheme::Ws | Scheme::Wss => Err(GatewayError::bad_request("websocket routes cannot be forwarded through the standard chain")),
		}
	}

	async fn forward_sse(&self, route: &RouteResult, req: &crate::request::Request) -> Result<Response, GatewayError> {
		let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
		let events = self.sse.connect(&route.instance, path_and_query).await?;
		let body_stream = events.map(|r| r.map(|e| Bytes::from(sse::serialize(&e))).map_err(std::io::Error::other));
		let body = Body::from_stream(body_stream);
		http::Response::builder()
			.status(http::StatusCode::OK)
			.header(http::header::CONTENT_TYPE, "text/event-stream")
			.header(http::header::CACHE_CONTROL, "no-cache")
			.body(body)
			.map_err(|e| GatewayError::internal("failed to build SSE response").with_source(e))
	}
}

fn wants_sse(req: &crate::request::Request) -> bool {
	req
		.headers()
		.get(http::header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.contains("text/event-stream"))
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::{DescriptorRegistry, DynamicTranscoder};
	use crate::request::Body as ReqBody;
	use crate::router::{RouteMetadata, RouteRule};

	fn connectors() -> Arc<Connectors> {
		let descriptors = DescriptorRegistry::new();
		Arc::new(Connectors {
			http: Arc::new(HttpConnector::new(std::time::Duration::from_secs(5))),
			grpc: Arc::new(GrpcConnector::new(descriptors.clone(), Arc::new(DynamicTranscoder::new(descriptors)))),
			sse: Arc::new(SSEConnector::new()),
		})
	}

	fn ws_route() -> RouteResult {
		RouteResult {
			rule: Arc::new(RouteRule {
				id: "ws".to_string(),
				pattern: crate::router::Pattern::parse("/ws"),
				methods: vec![],
				service_name: "svc".to_string(),
				timeout: None,
				retries: None,
				metadata: RouteMetadata::default(),
				session_affinity: None,
				rate_limit: None,
			}),
			instance: Arc::new(crate::registry::ServiceInstance::new("i1", "127.0.0.1", 9000, Scheme::Ws)),
			service_name: "svc".to_string(),
			params: Default::default(),
		}
	}

	#[tokio::test]
	async fn websocket_instance_is_rejected_at_forward() {
		let dispatch = connectors().dispatch();
		let mut req = http::Request::builder().uri("/ws").body(ReqBody::empty()).unwrap();
		req.extensions_mut().insert(ws_route());
		let err = dispatch(req).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::BadRequest);
	}

	#[tokio::test]
	async fn missing_route_result_is_an_internal_error() {
		let dispatch = connectors().dispatch();
		let req = http::Request::builder().uri("/whatever").body(ReqBody::empty()).unwrap();
		let err = dispatch(req).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Internal);
	}
}
