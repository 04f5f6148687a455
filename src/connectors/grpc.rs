//! gRPC connector + transcoder (spec §4.4.2): a lazily-opened, double-checked-locked connection
//! pool keyed by `address:port`, generic unary dispatch via `tonic`'s low-level `Grpc` client
//! with a byte-passthrough codec (no compiled service stubs — the gateway proxies arbitrary
//! services named only by route metadata), and JSON<->protobuf transcoding through the
//! descriptor registry when a route opts in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tonic::Status;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};

use crate::descriptor::{DescriptorRegistry, Transcoder};
use crate::error::{ErrorKind, GatewayError};
use crate::registry::ServiceInstance;
use crate::request::{Body, Request};

/// Passes bytes through unmodified; the descriptor registry/transcoder handle JSON<->protobuf
/// conversion *before* the codec ever sees the payload, so the codec itself stays schema-agnostic.
#[derive(Clone, Default)]
struct RawBytesCodec;

impl Codec for RawBytesCodec {
	type Encode = Bytes;
	type Decode = Bytes;
	type Encoder = RawBytesCodec;
	type Decoder = RawBytesCodec;

	fn encoder(&mut self) -> Self::Encoder {
		self.clone()
	}

	fn decoder(&mut self) -> Self::Decoder {
		self.clone()
	}
}

impl Encoder for RawBytesCodec {
	type Item = Bytes;
	type Error = Status;

	fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
		dst.put(item);
		Ok(())
	}
}

impl Decoder for RawBytesCodec {
	type Item = Bytes;
	type Error = Status;

	fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
		if !src.has_remaining() {
			return Ok(None);
		}
		let bytes = src.copy_to_bytes(src.remaining());
		Ok(Some(bytes))
	}
}

struct PooledChannel {
	channel: Channel,
}

/// Connection pool keyed by `address:port`. `Close` drops the whole map (spec §5).
pub struct GrpcConnector {
	pool: Mutex<HashMap<String, Arc<PooledChannel>>>,
	descriptors: Arc<DescriptorRegistry>,
	transcoder: Arc<dyn Transcoder>,
	keepalive_time: Duration,
	keepalive_timeout: Duration,
}

impl GrpcConnector {
	pub fn new(descriptors: Arc<DescriptorRegistry>, transcoder: Arc<dyn Transcoder>) -> Self {
		Self {
			pool: Mutex::new(HashMap::new()),
			descriptors,
			transcoder,
			keepalive_time: Duration::from_secs(30),
			keepalive_timeout: Duration::from_secs(10),
		}
	}

	pub fn with_keepalive(mut self, time: Duration, timeout: Duration) -> Self {
		self.keepalive_time = time;
		self.keepalive_timeout = timeout;
		self
	}

	fn pool_key(instance: &ServiceInstance) -> String {
		format!("{}:{}", instance.address, instance.port)
	}

	/// Double-checked lock: a read-ish check under the mutex, dial outside it would race two
	/// dials for the same key, so the whole thing (including the dial) stays under one lock —
	/// acceptable since dialing is lazy and rare compared to request volume.
	async fn channel_for(&self, instance: &ServiceInstance) -> Result<Channel, GatewayError> {
		let key = Self::pool_key(instance);
		if let Some(existing) = self.pool.lock().get(&key) {
			return Ok(existing.channel.clone());
		}

		let uses_tls = matches!(instance.scheme, crate::registry::Scheme::Https | crate::registry::Scheme::Grpc if instance.metadata.get("tls").map(String::as_str) == Some("true"));
		let scheme = if uses_tls { "https" } else { "http" };
		let uri = format!("{scheme}://{}:{}", instance.address, instance.port);
		let mut endpoint = Endpoint::from_shared(uri)
			.map_err(|e| GatewayError::bad_request("malformed gRPC endpoint").with_source(e))?
			.http2_keep_alive_interval(self.keepalive_time)
			.keep_alive_timeout(self.keepalive_timeout);
		if uses_tls {
			endpoint = endpoint
				.tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
				.map_err(|e| GatewayError::internal("failed to configure gRPC TLS").with_source(e))?;
		}

		let channel = endpoint.connect().await.map_err(|e| GatewayError::unavailable("failed to dial gRPC backend").with_source(e))?;

		let mut pool = self.pool.lock();
		let entry = pool.entry(key).or_insert_with(|| Arc::new(PooledChannel { channel: channel.clone() }));
		Ok(entry.channel.clone())
	}

	pub fn close(&self) {
		self.pool.lock().clear();
	}

	/// Performs one unary gRPC call, optionally transcoding to/from JSON first (spec §4.4.2).
	pub async fn call(&self, instance: &ServiceInstance, mut req: Request, enable_transcoding: bool) -> Result<http::Response<Body>, GatewayError> {
		let full_path = req.uri().path().to_string();
		let metadata = build_grpc_metadata(req.headers());

		let body_bytes = axum::body::to_bytes(std::mem::replace(req.body_mut(), Body::empty()), usize::MAX)
			.await
			.map_err(|e| GatewayError::bad_request("failed to read request body").with_source(e))?;

		let descriptor = if enable_transcoding {
			self.descriptors.method(&full_path)
		} else {
			None
		};

		let payload = match (&descriptor, enable_transcoding) {
			(Some(descriptor), true) => Bytes::from(self.transcoder.json_to_proto(descriptor, &body_bytes)?),
			_ => body_bytes,
		};

		let channel = self.channel_for(instance).await?;
		let mut client = Grpc::new(channel);
		client.ready().await.map_err(|e| GatewayError::unavailable("gRPC channel not ready").with_source(e))?;

		let path = full_path
			.parse::<http::uri::PathAndQuery>()
			.map_err(|e| GatewayError::bad_request("malformed gRPC method path").with_source(e))?;

		let mut request = tonic::Request::new(payload);
		*request.metadata_mut() = metadata;

		let result = client.unary(request, path, RawBytesCodec).await;

		match result {
			Ok(response) => {
				let (response_metadata, body, _extensions) = response.into_parts();
				let out_bytes = if let (Some(descriptor), true) = (&descriptor, enable_transcoding) {
					Bytes::from(self.transcoder.proto_to_json(descriptor, &body)?)
				} else {
					body
				};
				let mut builder = http::Response::builder().status(http::StatusCode::OK);
				for kv in response_metadata.into_headers().iter() {
					if let Ok(name) = http::HeaderName::from_bytes(kv.0.as_ref()) {
						if let Ok(value) = http::HeaderValue::from_bytes(kv.1.as_bytes()) {
							builder = builder.header(name, value);
						}
					}
				}
				builder
					.body(Body::from(out_bytes))
					.map_err(|e| GatewayError::internal("failed to build gRPC response").with_source(e))
			},
			Err(status) => Err(map_grpc_status(status)),
		}
	}
}

fn build_grpc_metadata(headers: &HeaderMap) -> tonic::metadata::MetadataMap {
	let mut metadata = tonic::metadata::MetadataMap::new();
	for (name, value) in headers {
		if name == http::header::HOST || name == http::header::CONTENT_LENGTH {
			continue;
		}
		if let (Ok(key), Ok(val)) = (
			tonic::metadata::MetadataKey::from_bytes(name.as_str().as_bytes()),
			tonic::metadata::MetadataValue::from_bytes(value.as_bytes()),
		) {
			metadata.insert(key, val);
		}
	}
	metadata
}

/// Spec §4.4.2: `NotFound`->`NotFound`, `InvalidArgument`->`BadRequest`, `DeadlineExceeded`->
/// `Timeout`, `Unavailable`->`Unavailable`, else `Internal`. Non-status (transport) errors also
/// resolve to `Internal` with the original error attached as cause.
fn map_grpc_status(status: Status) -> GatewayError {
	let kind = match status.code() {
		tonic::Code::NotFound => ErrorKind::NotFound,
		tonic::Code::InvalidArgument => ErrorKind::BadRequest,
		tonic::Code::DeadlineExceeded => ErrorKind::Timeout,
		tonic::Code::Unavailable => ErrorKind::Unavailable,
		_ => ErrorKind::Internal,
	};
	GatewayError::new(kind, status.message().to_string())
}

/// `Content-Type: application/grpc-web*` passthrough (spec §4.4.2, §9 open question: pass-through
/// takes priority over transcoding when both could apply).
pub fn is_grpc_web(headers: &HeaderMap) -> bool {
	headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|ct| ct.starts_with("application/grpc-web"))
		.unwrap_or(false)
}

pub fn grpc_web_preflight_response(method: &Method) -> Option<http::Response<Body>> {
	if method != Method::OPTIONS {
		return None;
	}
	http::Response::builder()
		.status(http::StatusCode::OK)
		.header("Access-Control-Allow-Origin", "*")
		.header("Access-Control-Allow-Methods", "POST,GET,OPTIONS")
		.header("Access-Control-Allow-Headers", "Content-Type,X-Grpc-Web,X-User-Agent")
		.header("Access-Control-Max-Age", "86400")
		.body(Body::empty())
		.ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping_matches_spec_table() {
		assert_eq!(map_grpc_status(Status::not_found("x")).kind, ErrorKind::NotFound);
		assert_eq!(map_grpc_status(Status::invalid_argument("x")).kind, ErrorKind::BadRequest);
		assert_eq!(map_grpc_status(Status::deadline_exceeded("x")).kind, ErrorKind::Timeout);
		assert_eq!(map_grpc_status(Status::unavailable("x")).kind, ErrorKind::Unavailable);
		assert_eq!(map_grpc_status(Status::internal("x")).kind, ErrorKind::Internal);
		assert_eq!(map_grpc_status(Status::permission_denied("x")).kind, ErrorKind::Internal);
	}

	#[test]
	fn grpc_web_content_type_is_detected() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, "application/grpc-web+proto".parse().unwrap());
		assert!(is_grpc_web(&headers));
		headers.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
		assert!(!is_grpc_web(&headers));
	}

	#[test]
	fn preflight_only_responds_to_options() {
		assert!(grpc_web_preflight_response(&Method::POST).is_none());
		assert!(grpc_web_preflight_response(&Method::OPTIONS).is_some());
	}
}
