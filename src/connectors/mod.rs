//! Protocol Connectors (spec §4.4): each connector establishes and streams a backend exchange
//! for one wire protocol, sharing the hop-by-hop header hygiene and `X-Forwarded-*` handling
//! described in spec §3's invariants. Grounded on the teacher's
//! `crates/agentgateway/src/proxy/httpproxy.rs` (`HOP_HEADERS`, `hop_by_hop_headers`).

pub mod grpc;
pub mod http;
pub mod sse;
pub mod websocket;

use ::http::{HeaderMap, HeaderName, HeaderValue};

/// RFC 7230 hop-by-hop headers plus the non-standard but commonly seen `Proxy-Connection` (spec
/// §9's redesign-flag suggestion, and §3's explicit invariant list).
pub static HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
	::http::header::CONNECTION,
	HeaderName::from_static("keep-alive"),
	::http::header::PROXY_AUTHENTICATE,
	::http::header::PROXY_AUTHORIZATION,
	::http::header::TE,
	::http::header::TRAILER,
	::http::header::TRANSFER_ENCODING,
	::http::header::UPGRADE,
];

pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Strips hop-by-hop headers in place, matched case-insensitively (the underlying `HeaderMap`
/// already normalizes header names, so simple removal suffices).
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP_HEADERS.iter() {
		headers.remove(name);
	}
	headers.remove(&PROXY_CONNECTION);
}

/// Appends the standard `X-Forwarded-*` trio. `For`/`Host` are always derived from what the
/// gateway itself observed; `Proto` is supplied by the caller since whether to trust an upstream
/// proxy's claim is a deployment-level decision (spec §3).
pub fn apply_forwarded_headers(headers: &mut HeaderMap, remote_addr: Option<std::net::SocketAddr>, host: Option<&str>, proto: &str) {
	if let Some(remote) = remote_addr {
		append_header(headers, "x-forwarded-for", &remote.ip().to_string());
	}
	if let Some(host) = host {
		append_header(headers, "x-forwarded-host", host);
	}
	append_header(headers, "x-forwarded-proto", proto);
}

fn append_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
	let Ok(value) = HeaderValue::from_str(value) else { return };
	headers.append(HeaderName::from_static(name), value);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_all_hop_by_hop_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(::http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
		headers.insert(::http::header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(&PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
		headers.insert("x-custom", HeaderValue::from_static("keep-me"));
		strip_hop_by_hop(&mut headers);
		assert!(headers.get(::http::header::CONNECTION).is_none());
		assert!(headers.get(::http::header::UPGRADE).is_none());
		assert!(headers.get(&PROXY_CONNECTION).is_none());
		assert!(headers.get("x-custom").is_some());
	}

	#[test]
	fn forwarded_headers_use_observed_remote() {
		let mut headers = HeaderMap::new();
		let addr: std::net::SocketAddr = "10.1.2.3:5555".parse().unwrap();
		apply_forwarded_headers(&mut headers, Some(addr), Some("api.example.com"), "https");
		assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.1.2.3");
		assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");
		assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
	}
}
