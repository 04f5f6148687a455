//! HTTP connector (spec §4.4.1): builds a backend URL from the chosen instance, streams the
//! request/response bodies unbuffered, strips hop-by-hop headers, and adds the `X-Forwarded-*`
//! trio. Errors are classified per spec: cancelled/deadline -> Timeout, dial/refused ->
//! Unavailable, malformed URL -> BadRequest, everything else -> Unavailable.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Method};

use super::{apply_forwarded_headers, strip_hop_by_hop};
use crate::error::GatewayError;
use crate::registry::ServiceInstance;
use crate::request::{Body, Request};

pub struct HttpConnector {
	client: reqwest::Client,
	default_timeout: Duration,
}

impl HttpConnector {
	pub fn new(default_timeout: Duration) -> Self {
		Self {
			client: reqwest::Client::builder()
				.pool_idle_timeout(Duration::from_secs(90))
				.build()
				.expect("reqwest client with no custom TLS config should always build"),
			default_timeout,
		}
	}

	fn backend_url(instance: &ServiceInstance, path_and_query: &str) -> Result<reqwest::Url, GatewayError> {
		let raw = format!("{}{}", instance.base_url(), path_and_query);
		reqwest::Url::parse(&raw).map_err(|e| GatewayError::bad_request(format!("malformed backend URL '{raw}'")).with_source(e))
	}

	pub async fn forward(&self, instance: &ServiceInstance, mut req: Request, remote_addr: Option<SocketAddr>, timeout: Option<Duration>) -> Result<http::Response<Body>, GatewayError> {
		let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
		let url = Self::backend_url(instance, path_and_query)?;

		strip_hop_by_hop(req.headers_mut());
		let host = req
			.headers()
			.get(http::header::HOST)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		apply_forwarded_headers(req.headers_mut(), remote_addr, host.as_deref(), instance.scheme.as_str());

		let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
		let headers = convert_headers(req.headers());
		let body_stream = req.into_body().into_data_stream().map_ok(|chunk: Bytes| chunk).map_err(std::io::Error::other);
		let body = reqwest::Body::wrap_stream(body_stream);

		let mut builder = self.client.request(method, url).headers(headers).body(body);
		builder = builder.timeout(timeout.unwrap_or(self.default_timeout));

		let resp = builder.send().await.map_err(classify_reqwest_error)?;

		let status = http::StatusCode::from_u16(resp.status().as_u16()).unwrap_or(http::StatusCode::BAD_GATEWAY);
		let mut response_headers = HeaderMap::new();
		for (name, value) in resp.headers() {
			if let (Ok(name), Ok(value)) = (
				http::HeaderName::from_bytes(name.as_str().as_bytes()),
				http::HeaderValue::from_bytes(value.as_bytes()),
			) {
				response_headers.append(name, value);
			}
		}
		strip_hop_by_hop(&mut response_headers);

		let body = Body::from_stream(resp.bytes_stream());
		let mut builder = http::Response::builder().status(status);
		*builder.headers_mut().expect("builder with known status should have headers") = response_headers;
		builder
			.body(body)
			.map_err(|e| GatewayError::internal("failed to build backend response").with_source(e))
	}
}

fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
	let mut out = reqwest::header::HeaderMap::new();
	for (name, value) in headers {
		if let (Ok(name), Ok(value)) = (
			reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
			reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
		) {
			out.append(name, value);
		}
	}
	out
}

fn classify_reqwest_error(err: reqwest::Error) -> GatewayError {
	if err.is_timeout() {
		GatewayError::timeout("backend request timed out").with_source(err)
	} else if err.is_connect() {
		GatewayError::unavailable("backend connection refused").with_source(err)
	} else {
		GatewayError::unavailable("backend request failed").with_source(err)
	}
}

pub fn request_matches_method(req: &Request, methods: &[Method]) -> bool {
	methods.is_empty() || methods.iter().any(|m| m == req.method())
}
