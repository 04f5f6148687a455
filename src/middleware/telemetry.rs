//! Telemetry (spec §4.6, §10.1): logs one line per request at completion with request id,
//! method, path, status, and duration; mid-chain failures log at `warn`/`error` from this layer
//! rather than from a central dispatcher, matching the corpus's per-component logging practice.

use std::time::Instant;

use futures::future::BoxFuture;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, RequestContext, Response};

pub struct Telemetry;

impl Middleware for Telemetry {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		Box::pin(async move {
			let method = req.method().clone();
			let path = req.uri().path().to_string();
			let request_id = req.extensions().get::<RequestContext>().map(|ctx| ctx.id.to_string());
			let start = Instant::now();

			let result = next(req).await;
			let duration_ms = start.elapsed().as_millis();

			match &result {
				Ok(resp) => {
					tracing::info!(
						request_id = request_id.as_deref().unwrap_or("-"),
						%method,
						%path,
						status = resp.status().as_u16(),
						duration_ms,
						"request completed"
					);
				},
				Err(err) => {
					tracing::warn!(
						request_id = request_id.as_deref().unwrap_or("-"),
						%method,
						%path,
						kind = %err.kind,
						duration_ms,
						"request failed"
					);
				},
			}
			result
		})
	}
}
