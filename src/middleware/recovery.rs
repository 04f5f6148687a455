//! Recovery (spec §4.6): converts any panic from inside the chain into an `Internal` error
//! instead of letting it abort the process. Must wrap everything else so a panic anywhere
//! downstream — including inside user-authored filters — still produces a protocol-correct
//! response.

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, Response};

pub struct Recovery;

impl Middleware for Recovery {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		Box::pin(async move {
			// Panics inside an async fn can't be caught with `std::panic::catch_unwind` across
			// await points directly, so the call runs on its own task and we inspect the
			// `JoinError` instead — the same effect, since a task panic surfaces there.
			let fut = next(req);
			match tokio::spawn(fut).await {
				Ok(result) => result,
				Err(join_err) => {
					let message = if join_err.is_panic() {
						panic_message(join_err.into_panic())
					} else {
						"request task was cancelled".to_string()
					};
					tracing::error!(message = %message, "recovered panic in request handling");
					Err(GatewayError::internal(message))
				},
			}
		})
	}
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::request::Body;

	#[tokio::test]
	async fn panic_in_chain_becomes_internal_error() {
		let recovery = Recovery;
		let next: Next = Arc::new(|_req| Box::pin(async { panic!("boom") }));
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let err = recovery.handle(req, next).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::Internal);
		assert!(err.message.contains("boom"));
	}

	#[tokio::test]
	async fn non_panicking_calls_pass_through() {
		let recovery = Recovery;
		let next: Next = Arc::new(|_req| Box::pin(async { Ok(http::Response::builder().status(200).body(Body::empty()).unwrap()) }));
		let req = http::Request::builder().body(Body::empty()).unwrap();
		let resp = recovery.handle(req, next).await.unwrap();
		assert_eq!(resp.status(), 200);
	}
}
