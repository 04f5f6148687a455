//! The gateway's single public error taxonomy (spec §7).

use std::collections::HashMap;
use std::fmt;

use axum::response::{IntoResponse, Response};
use http::StatusCode;

/// The only public error kinds the gateway produces. Every failure path, from a malformed
/// request to a panic caught by the recovery middleware, resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	BadRequest,
	Unauthorized,
	Forbidden,
	NotFound,
	Timeout,
	RateLimit,
	Unavailable,
	Internal,
}

impl ErrorKind {
	pub fn status_code(self) -> StatusCode {
		match self {
			ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
			ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
			ErrorKind::Forbidden => StatusCode::FORBIDDEN,
			ErrorKind::NotFound => StatusCode::NOT_FOUND,
			ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
			ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Retry middleware only ever retries these two kinds (spec §4.6).
	pub fn is_retryable(self) -> bool {
		matches!(self, ErrorKind::Timeout | ErrorKind::Unavailable)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::BadRequest => "bad_request",
			ErrorKind::Unauthorized => "unauthorized",
			ErrorKind::Forbidden => "forbidden",
			ErrorKind::NotFound => "not_found",
			ErrorKind::Timeout => "timeout",
			ErrorKind::RateLimit => "rate_limit",
			ErrorKind::Unavailable => "unavailable",
			ErrorKind::Internal => "internal",
		};
		f.write_str(s)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
	pub kind: ErrorKind,
	pub message: String,
	#[source]
	pub source: Option<anyhow::Error>,
	pub details: HashMap<String, String>,
}

impl GatewayError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			source: None,
			details: HashMap::new(),
		}
	}

	pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
		self.source = Some(source.into());
		self
	}

	pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.details.insert(key.into(), value.into());
		self
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::BadRequest, message)
	}
	pub fn unauthorized(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Unauthorized, message)
	}
	pub fn forbidden(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Forbidden, message)
	}
	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}
	pub fn timeout(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Timeout, message)
	}
	pub fn rate_limited(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::RateLimit, message)
	}
	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Unavailable, message)
	}
	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Internal, message)
	}

	pub fn is_retryable(&self) -> bool {
		self.kind.is_retryable()
	}
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		tracing::warn!(kind = %self.kind, message = %self.message, details = ?self.details, "request failed");
		let mut builder = axum::http::Response::builder()
			.status(self.kind.status_code())
			.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
		if self.kind == ErrorKind::RateLimit {
			builder = builder.header("Retry-After", "1");
		}
		builder
			.body(axum::body::Body::from(self.message))
			.expect("builder with known status code should not fail")
	}
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes_match_spec_table() {
		assert_eq!(ErrorKind::BadRequest.status_code(), StatusCode::BAD_REQUEST);
		assert_eq!(ErrorKind::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
		assert_eq!(ErrorKind::Forbidden.status_code(), StatusCode::FORBIDDEN);
		assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
		assert_eq!(ErrorKind::Timeout.status_code(), StatusCode::REQUEST_TIMEOUT);
		assert_eq!(ErrorKind::RateLimit.status_code(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(ErrorKind::Unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(ErrorKind::Internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[test]
	fn only_timeout_and_unavailable_retry() {
		for kind in [
			ErrorKind::BadRequest,
			ErrorKind::Unauthorized,
			ErrorKind::Forbidden,
			ErrorKind::NotFound,
			ErrorKind::RateLimit,
			ErrorKind::Internal,
		] {
			assert!(!kind.is_retryable());
		}
		assert!(ErrorKind::Timeout.is_retryable());
		assert!(ErrorKind::Unavailable.is_retryable());
	}
}
