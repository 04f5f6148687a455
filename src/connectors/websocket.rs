//! WebSocket connector (spec §4.4.4): dials the chosen instance's ws(s) URL, forwarding
//! non-hop-by-hop headers plus `X-Forwarded-*`, then shuttles messages bidirectionally until
//! either side closes. Also implements the origin check, connection-cap semaphore, and JWT
//! token-lifecycle re-validation the frontend upgrade handler consults. No teacher module
//! proxies WebSocket directly; written fresh against `tokio-tungstenite`, following the
//! connection-outlives-the-handler idiom from spec §4.4.4 / §9.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use super::{apply_forwarded_headers, strip_hop_by_hop};
use crate::error::GatewayError;
use crate::registry::ServiceInstance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessageType {
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

#[derive(Debug, Clone)]
pub struct WebSocketMessage {
	pub message_type: WebSocketMessageType,
	pub data: Vec<u8>,
}

impl From<TungsteniteMessage> for WebSocketMessage {
	fn from(msg: TungsteniteMessage) -> Self {
		match msg {
			TungsteniteMessage::Text(t) => Self { message_type: WebSocketMessageType::Text, data: t.into() },
			TungsteniteMessage::Binary(b) => Self { message_type: WebSocketMessageType::Binary, data: b.into() },
			TungsteniteMessage::Close(_) => Self { message_type: WebSocketMessageType::Close, data: Vec::new() },
			TungsteniteMessage::Ping(p) => Self { message_type: WebSocketMessageType::Ping, data: p.into() },
			TungsteniteMessage::Pong(p) => Self { message_type: WebSocketMessageType::Pong, data: p.into() },
			TungsteniteMessage::Frame(_) => Self { message_type: WebSocketMessageType::Binary, data: Vec::new() },
		}
	}
}

/// Gates upgrades with a counting semaphore of size `max_connections`; a full gate means 503
/// "Too Many Connections" (spec §4.4.4, §6).
pub struct ConnectionGate {
	semaphore: Arc<Semaphore>,
}

pub struct GateTicket {
	_permit: tokio::sync::OwnedSemaphorePermit,
}

impl ConnectionGate {
	pub fn new(max_connections: usize) -> Self {
		Self { semaphore: Arc::new(Semaphore::new(max_connections)) }
	}

	pub fn try_acquire(&self) -> Option<GateTicket> {
		self.semaphore.clone().try_acquire_owned().ok().map(|permit| GateTicket { _permit: permit })
	}
}

#[derive(Debug, Clone)]
pub enum OriginPolicy {
	Disabled,
	AllowList(Vec<String>),
}

/// Accept iff `Origin` host+port equals the request host+port, or the origin is in the
/// allow-list (exact, wildcard `*`, or normalized with the default port added when absent) —
/// spec §4.4.4.
pub fn check_origin(policy: &OriginPolicy, origin: Option<&str>, request_host: &str, default_port_for_scheme: impl Fn(&str) -> u16) -> bool {
	let OriginPolicy::AllowList(allowed) = policy else { return true };
	let Some(origin) = origin else { return true };

	if allowed.iter().any(|a| a == "*") {
		return true;
	}

	let normalized_origin = normalize_host(origin, &default_port_for_scheme);
	let normalized_request = normalize_host(request_host, &default_port_for_scheme);
	if normalized_origin == normalized_request {
		return true;
	}
	allowed.iter().any(|a| normalize_host(a, &default_port_for_scheme) == normalized_origin)
}

fn normalize_host(raw: &str, default_port_for_scheme: &impl Fn(&str) -> u16) -> String {
	let without_scheme = raw.splitn(2, "://").last().unwrap_or(raw);
	let scheme = raw.splitn(2, "://").next().unwrap_or("http");
	if without_scheme.contains(':') {
		without_scheme.to_string()
	} else {
		format!("{without_scheme}:{}", default_port_for_scheme(scheme))
	}
}

pub fn default_port_for_scheme(scheme: &str) -> u16 {
	match scheme {
		"https" | "wss" => 443,
		_ => 80,
	}
}

/// Arms a background timer that re-validates the JWT a few seconds before `exp`; on expiry the
/// close frame 1000 "authentication expired" is written and the socket is closed (spec §4.4.4).
pub struct TokenValidator {
	cancel: tokio_util::sync::CancellationToken,
}

impl TokenValidator {
	/// `margin` controls how long before `exp` the close is fired.
	pub fn arm<F>(expires_at: SystemTime, margin: Duration, on_expiry: F) -> Self
	where
		F: FnOnce() + Send + 'static,
	{
		let cancel = tokio_util::sync::CancellationToken::new();
		let fire_at = expires_at.checked_sub(margin).unwrap_or(SystemTime::now());
		let delay = fire_at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
		let cancel_clone = cancel.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = cancel_clone.cancelled() => {},
				_ = tokio::time::sleep(delay) => on_expiry(),
			}
		});
		Self { cancel }
	}

	pub fn stop(&self) {
		self.cancel.cancel();
	}
}

impl Drop for TokenValidator {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Dials the backend, forwarding non-hop-by-hop headers plus `X-Forwarded-*`, and returns the
/// connected backend stream ready for bidirectional shuttling against the frontend connection.
pub async fn dial_backend(
	instance: &ServiceInstance,
	path_and_query: &str,
	mut headers: http::HeaderMap,
	remote_addr: Option<SocketAddr>,
) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, GatewayError> {
	strip_hop_by_hop(&mut headers);
	let host = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string);
	apply_forwarded_headers(&mut headers, remote_addr, host.as_deref(), instance.scheme.as_str());

	let url = format!("{}{}", instance.base_url(), path_and_query);
	let mut request = url
		.into_client_request()
		.map_err(|e| GatewayError::bad_request("malformed WebSocket backend URL").with_source(e))?;
	for (name, value) in headers.iter() {
		if name == http::header::HOST || name == http::header::CONNECTION || name == http::header::UPGRADE {
			continue;
		}
		request.headers_mut().insert(name.clone(), value.clone());
	}

	let (stream, _response) = tokio_tungstenite::connect_async(request)
		.await
		.map_err(|e| GatewayError::unavailable("failed to dial WebSocket backend").with_source(e))?;
	Ok(stream)
}

/// Shuttles messages bidirectionally between the frontend and backend sockets until either side
/// closes or a write fails. Caller supplies the frontend half as a `Sink`/`Stream` pair (the
/// concrete type depends on the HTTP server library's upgrade API).
pub async fn shuttle<FS, FE, BS, BE>(mut frontend: FS, mut backend: BS) -> Result<(), GatewayError>
where
	FS: futures_util::Sink<TungsteniteMessage, Error = FE> + futures_util::Stream<Item = Result<TungsteniteMessage, FE>> + Unpin,
	BS: futures_util::Sink<TungsteniteMessage, Error = BE> + futures_util::Stream<Item = Result<TungsteniteMessage, BE>> + Unpin,
{
	loop {
		tokio::select! {
			msg = frontend.next() => {
				match msg {
					Some(Ok(m)) => {
						let is_close = matches!(m, TungsteniteMessage::Close(_));
						if backend.send(m).await.is_err() {
							return Ok(());
						}
						if is_close {
							return Ok(());
						}
					}
					_ => return Ok(()),
				}
			}
			msg = backend.next() => {
				match msg {
					Some(Ok(m)) => {
						let is_close = matches!(m, TungsteniteMessage::Close(_));
						if frontend.send(m).await.is_err() {
							return Ok(());
						}
						if is_close {
							return Ok(());
						}
					}
					_ => return Ok(()),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_host_port_is_allowed() {
		let policy = OriginPolicy::AllowList(vec!["https://api.example.com".to_string()]);
		assert!(check_origin(&policy, Some("https://api.example.com"), "api.example.com:443", default_port_for_scheme));
	}

	#[test]
	fn wildcard_allows_everything() {
		let policy = OriginPolicy::AllowList(vec!["*".to_string()]);
		assert!(check_origin(&policy, Some("https://evil.example.com"), "api.example.com:443", default_port_for_scheme));
	}

	#[test]
	fn mismatched_origin_is_rejected() {
		let policy = OriginPolicy::AllowList(vec!["https://allowed.example.com".to_string()]);
		assert!(!check_origin(&policy, Some("https://evil.example.com"), "api.example.com:443", default_port_for_scheme));
	}

	#[test]
	fn disabled_policy_always_allows() {
		assert!(check_origin(&OriginPolicy::Disabled, Some("https://evil.example.com"), "api.example.com:443", default_port_for_scheme));
	}

	#[test]
	fn connection_gate_limits_concurrent_upgrades() {
		let gate = ConnectionGate::new(1);
		let first = gate.try_acquire();
		assert!(first.is_some());
		assert!(gate.try_acquire().is_none());
		drop(first);
		assert!(gate.try_acquire().is_some());
	}
}
