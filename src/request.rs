//! Request identity and per-request cancellation, attached to every inbound request as an
//! extension rather than threaded as a separate facade type — the gateway's `Request`/`Response`
//! are plain `http::Request<Body>`/`http::Response<Body>`, matching the rest of the corpus.

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio_util::sync::CancellationToken;

pub type Body = axum::body::Body;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

/// A millisecond-epoch timestamp dash a random 4-byte hex suffix. Monotonic non-decreasing
/// timestamp prefix; the suffix only needs to disambiguate collisions within the same
/// millisecond (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
	pub fn generate() -> Self {
		let millis = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis();
		let mut suffix = [0u8; 4];
		rand::rng().fill_bytes(&mut suffix);
		Self(format!("{millis:013x}-{}", hex(&suffix)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Carried in `Request::extensions()` for the lifetime of one request exchange. Cloning the
/// token (not the context) is how downstream tasks (the backend call, a WebSocket shuttle)
/// observe cancellation without owning the whole context.
#[derive(Clone)]
pub struct RequestContext {
	pub id: RequestId,
	pub remote_addr: Option<SocketAddr>,
	pub cancellation: CancellationToken,
	pub deadline: Option<std::time::Instant>,
}

impl RequestContext {
	pub fn new(remote_addr: Option<SocketAddr>) -> Self {
		Self {
			id: RequestId::generate(),
			remote_addr,
			cancellation: CancellationToken::new(),
			deadline: None,
		}
	}

	pub fn with_deadline(mut self, deadline: std::time::Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}

	pub fn remaining(&self) -> Option<std::time::Duration> {
		self.deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_ids_are_unique_and_monotonic_prefix() {
		let a = RequestId::generate();
		std::thread::sleep(std::time::Duration::from_millis(2));
		let b = RequestId::generate();
		assert_ne!(a.as_str(), b.as_str());
		let prefix_a = &a.as_str()[..13];
		let prefix_b = &b.as_str()[..13];
		assert!(prefix_a <= prefix_b);
	}
}
