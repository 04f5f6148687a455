//! Sticky-session wrapper (spec §4.2): extracts a session id from a cookie/header/query param,
//! consults the session store, and falls back to a wrapped policy on a miss.

use std::sync::Arc;
use std::time::Duration;

use super::{BalancerError, LoadBalancer};
use crate::registry::{ServiceInstance, Snapshot};
use crate::request::Request;
use crate::session::SessionStore;

#[derive(Debug, Clone)]
pub enum SessionSource {
	Cookie(String),
	Header(String),
	Query(String),
}

pub struct StickySession {
	inner: Arc<dyn LoadBalancer>,
	store: Arc<SessionStore>,
	source: SessionSource,
	ttl: Duration,
}

impl StickySession {
	pub fn new(inner: Arc<dyn LoadBalancer>, store: Arc<SessionStore>, source: SessionSource, ttl: Duration) -> Self {
		Self { inner, store, source, ttl }
	}

	fn extract_session_id(&self, request: &Request) -> Option<String> {
		match &self.source {
			SessionSource::Header(name) => request
				.headers()
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(|s| s.to_string()),
			SessionSource::Cookie(name) => request
				.headers()
				.get_all(http::header::COOKIE)
				.iter()
				.filter_map(|v| v.to_str().ok())
				.flat_map(|v| v.split(';'))
				.find_map(|pair| {
					let pair = pair.trim();
					let (k, v) = pair.split_once('=')?;
					(k == name).then(|| v.to_string())
				}),
			SessionSource::Query(name) => request.uri().query().and_then(|q| {
				url::form_urlencoded::parse(q.as_bytes())
					.find(|(k, _)| k == name)
					.map(|(_, v)| v.into_owned())
			}),
		}
	}
}

impl LoadBalancer for StickySession {
	fn select(&self, snapshot: &Snapshot, request: &Request) -> Result<Arc<ServiceInstance>, BalancerError> {
		let Some(session_id) = self.extract_session_id(request) else {
			return self.inner.select(snapshot, request);
		};

		if let Some(instance_id) = self.store.get(&session_id) {
			match snapshot.iter().find(|i| i.id == instance_id) {
				Some(instance) if instance.healthy() => return Ok(instance.clone()),
				_ => self.store.remove(&session_id),
			}
		}

		let selected = self.inner.select(snapshot, request)?;
		self.store.insert(session_id, selected.id.clone(), self.ttl);
		Ok(selected)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::balancer::weighted_random::WeightedRandom;
	use crate::registry::Scheme;

	fn instance(id: &str) -> Arc<ServiceInstance> {
		Arc::new(ServiceInstance::new(id, "10.0.0.1", 80, Scheme::Http))
	}

	#[test]
	fn same_session_lands_on_same_instance_while_healthy() {
		let a = instance("A");
		let b = instance("B");
		let snapshot: Snapshot = Arc::new(vec![a, b]);
		let store = SessionStore::new(100);
		let lb = StickySession::new(
			Arc::new(WeightedRandom),
			store,
			SessionSource::Header("x-session".into()),
			Duration::from_secs(60),
		);

		let req = http::Request::builder()
			.header("x-session", "abc")
			.body(crate::request::Body::empty())
			.unwrap();
		let first = lb.select(&snapshot, &req).unwrap().id.clone();
		for _ in 0..10 {
			assert_eq!(lb.select(&snapshot, &req).unwrap().id, first);
		}
	}

	#[test]
	fn unhealthy_target_falls_back_and_remaps() {
		let a = instance("A");
		let b = instance("B");
		let snapshot: Snapshot = Arc::new(vec![a.clone(), b.clone()]);
		let store = SessionStore::new(100);
		store.insert("abc".into(), "A".into(), Duration::from_secs(60));
		a.set_healthy(false);

		let lb = StickySession::new(
			Arc::new(WeightedRandom),
			store,
			SessionSource::Header("x-session".into()),
			Duration::from_secs(60),
		);
		let req = http::Request::builder()
			.header("x-session", "abc")
			.body(crate::request::Body::empty())
			.unwrap();
		let picked = lb.select(&snapshot, &req).unwrap();
		assert_eq!(picked.id, "B");
	}

	#[test]
	fn no_session_id_does_not_store_mapping() {
		let a = instance("A");
		let snapshot: Snapshot = Arc::new(vec![a]);
		let store = SessionStore::new(100);
		let lb = StickySession::new(
			Arc::new(WeightedRandom),
			store.clone(),
			SessionSource::Header("x-session".into()),
			Duration::from_secs(60),
		);
		let req = http::Request::builder().body(crate::request::Body::empty()).unwrap();
		let _ = lb.select(&snapshot, &req).unwrap();
		assert!(store.is_empty());
	}
}
