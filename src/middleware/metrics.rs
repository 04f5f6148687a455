//! Metrics (spec §4.6, §10.5): wraps the circuit breaker so rejected calls are still counted.
//! Registers the gateway-level series named in `SPEC_FULL.md` §10.5 against a shared
//! `prometheus_client::registry::Registry`, exposed by the management `/metrics` endpoint.

use std::time::Instant;

use futures::future::BoxFuture;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use super::{Middleware, Next};
use crate::error::GatewayError;
use crate::request::{Request, Response};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub method: String,
	pub route: String,
	pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
	pub kind: String,
}

pub struct Metrics {
	requests_total: Family<RequestLabels, Counter>,
	request_duration_seconds: Histogram,
	upstream_errors_total: Family<ErrorLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests_total = Family::<RequestLabels, Counter>::default();
		let request_duration_seconds = Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter());
		let upstream_errors_total = Family::<ErrorLabels, Counter>::default();

		registry.register("gateway_requests_total", "Total requests processed", requests_total.clone());
		registry.register("gateway_request_duration_seconds", "Request duration", request_duration_seconds.clone());
		registry.register("gateway_upstream_errors_total", "Upstream errors by kind", upstream_errors_total.clone());

		Self { requests_total, request_duration_seconds, upstream_errors_total }
	}
}

impl Middleware for Metrics {
	fn handle(&self, req: Request, next: Next) -> BoxFuture<'static, Result<Response, GatewayError>> {
		let requests_total = self.requests_total.clone();
		let request_duration_seconds = self.request_duration_seconds.clone();
		let upstream_errors_total = self.upstream_errors_total.clone();
		Box::pin(async move {
			let method = req.method().to_string();
			let route = req.uri().path().to_string();
			let start = Instant::now();
			let result = next(req).await;
			request_duration_seconds.observe(start.elapsed().as_secs_f64());

			let status = match &result {
				Ok(resp) => resp.status().as_u16(),
				Err(err) => {
					upstream_errors_total.get_or_create(&ErrorLabels { kind: err.kind.to_string() }).inc();
					err.kind.status_code().as_u16()
				},
			};
			requests_total.get_or_create(&RequestLabels { method, route, status }).inc();
			result
		})
	}
}
