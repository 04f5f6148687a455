//! SSE connector (spec §4.4.3): issues a GET with the event-stream accept header, rejects
//! non-200/wrong content type, and exposes the backend as a parsed `SSEEvent` stream following
//! the SSE field grammar. Generic parsing is written fresh against `eventsource-stream`, which
//! sits in the teacher's own root `Cargo.toml` dependency table (the teacher's own SSE handling
//! in `parse/sse.rs` is LLM-stream specific and not reused directly).

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};

use crate::error::GatewayError;
use crate::registry::ServiceInstance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSEEvent {
	pub id: Option<String>,
	pub event_type: String,
	pub data: String,
	pub retry: Option<u64>,
	pub comment: Option<String>,
}

impl Default for SSEEvent {
	fn default() -> Self {
		Self {
			id: None,
			event_type: "message".to_string(),
			data: String::new(),
			retry: None,
			comment: None,
		}
	}
}

pub struct SSEConnector {
	client: reqwest::Client,
}

impl SSEConnector {
	pub fn new() -> Self {
		Self { client: reqwest::Client::new() }
	}

	pub async fn connect(&self, instance: &ServiceInstance, path_and_query: &str) -> Result<impl Stream<Item = Result<SSEEvent, GatewayError>> + use<>, GatewayError> {
		let url = format!("{}{}", instance.base_url(), path_and_query);
		let resp = self
			.client
			.get(&url)
			.header(http::header::ACCEPT, "text/event-stream")
			.header(http::header::CACHE_CONTROL, "no-cache")
			.send()
			.await
			.map_err(|e| classify(e))?;

		if resp.status() != reqwest::StatusCode::OK {
			return Err(GatewayError::unavailable(format!("SSE backend responded with status {}", resp.status())));
		}
		let content_type_ok = resp
			.headers()
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(|ct| ct.starts_with("text/event-stream"))
			.unwrap_or(false);
		if !content_type_ok {
			return Err(GatewayError::bad_request("SSE backend did not return text/event-stream"));
		}

		let byte_stream = resp.bytes_stream().map(|r| r.map_err(std::io::Error::other));
		let events = byte_stream.eventsource().map(|evt| {
			evt.map(|e| SSEEvent {
				id: if e.id.is_empty() { None } else { Some(e.id) },
				event_type: if e.event.is_empty() { "message".to_string() } else { e.event },
				data: e.data,
				retry: e.retry.map(|d| d.as_millis() as u64),
				comment: None,
			})
			.map_err(|e| GatewayError::internal("SSE stream error").with_source(e))
		});
		Ok(events)
	}
}

impl Default for SSEConnector {
	fn default() -> Self {
		Self::new()
	}
}

fn classify(err: reqwest::Error) -> GatewayError {
	if err.is_timeout() {
		GatewayError::timeout("SSE backend connection timed out").with_source(err)
	} else {
		GatewayError::unavailable("failed to connect to SSE backend").with_source(err)
	}
}

/// Serializes a single event back onto the wire, used both by tests (round-trip) and by a
/// frontend adapter relaying a transformed event to the client.
pub fn serialize(event: &SSEEvent) -> String {
	let mut out = String::new();
	if let Some(id) = &event.id {
		out.push_str(&format!("id: {id}\n"));
	}
	if event.event_type != "message" {
		out.push_str(&format!("event: {}\n", event.event_type));
	}
	for line in event.data.split('\n') {
		out.push_str(&format!("data: {line}\n"));
	}
	if let Some(retry) = event.retry {
		out.push_str(&format!("retry: {retry}\n"));
	}
	out.push('\n');
	out
}

pub fn retry_after() -> Duration {
	Duration::from_secs(3)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn serializes_with_default_event_type_omitted() {
		let event = SSEEvent {
			id: Some("1".to_string()),
			event_type: "message".to_string(),
			data: "hello\nworld".to_string(),
			retry: None,
			comment: None,
		};
		let wire = serialize(&event);
		assert!(wire.contains("id: 1\n"));
		assert!(!wire.contains("event:"));
		assert!(wire.contains("data: hello\n"));
		assert!(wire.contains("data: world\n"));
	}

	#[test]
	fn custom_event_type_is_emitted() {
		let event = SSEEvent { event_type: "update".to_string(), data: "x".to_string(), ..Default::default() };
		assert!(serialize(&event).contains("event: update\n"));
	}
}
