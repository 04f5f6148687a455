//! Smooth weighted round robin, Nginx-style (spec §4.2): on each selection every healthy entry's
//! `current_weight` grows by its effective weight; the max is picked, then debited by the sum of
//! all healthy effective weights. Rebuilds its internal state whenever the instance id set or
//! health bits change, since a stale `current_weight` table would bias the next few picks.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{BalancerError, LoadBalancer, healthy_iter};
use crate::registry::{ServiceInstance, Snapshot};
use crate::request::Request;

struct Entry {
	id: String,
	effective_weight: f64,
	current_weight: f64,
}

#[derive(Default)]
struct State {
	/// A fingerprint of (id, healthy) pairs in snapshot order; cheap way to detect "the healthy
	/// set changed" without comparing full instance contents.
	fingerprint: Vec<(String, bool)>,
	entries: Vec<Entry>,
}

pub struct SmoothWeightedRoundRobin {
	state: Mutex<State>,
}

impl SmoothWeightedRoundRobin {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State::default()),
		}
	}

	fn fingerprint(snapshot: &Snapshot) -> Vec<(String, bool)> {
		snapshot.iter().map(|i| (i.id.clone(), i.healthy())).collect()
	}
}

impl Default for SmoothWeightedRoundRobin {
	fn default() -> Self {
		Self::new()
	}
}

impl LoadBalancer for SmoothWeightedRoundRobin {
	fn select(&self, snapshot: &Snapshot, _request: &Request) -> Result<Arc<ServiceInstance>, BalancerError> {
		let fingerprint = Self::fingerprint(snapshot);
		let mut state = self.state.lock();
		if state.fingerprint != fingerprint {
			state.entries = healthy_iter(snapshot)
				.map(|i| Entry {
					id: i.id.clone(),
					effective_weight: i.weight().max(0.0),
					current_weight: 0.0,
				})
				.collect();
			state.fingerprint = fingerprint;
		}

		if state.entries.is_empty() {
			return Err(BalancerError::NoHealthyInstance);
		}

		let total: f64 = state.entries.iter().map(|e| e.effective_weight).sum();
		for e in state.entries.iter_mut() {
			e.current_weight += e.effective_weight;
		}
		let winner_idx = state
			.entries
			.iter()
			.enumerate()
			.max_by(|(_, a), (_, b)| a.current_weight.total_cmp(&b.current_weight))
			.map(|(idx, _)| idx)
			.expect("entries is non-empty");
		state.entries[winner_idx].current_weight -= total;
		let winner_id = state.entries[winner_idx].id.clone();
		drop(state);

		snapshot
			.iter()
			.find(|i| i.id == winner_id && i.healthy())
			.cloned()
			.ok_or(BalancerError::NoHealthyInstance)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::registry::Scheme;

	fn instance(id: &str, weight: u32) -> Arc<ServiceInstance> {
		let mut meta = HashMap::new();
		meta.insert("weight".to_string(), weight.to_string());
		Arc::new(ServiceInstance::new(id, "10.0.0.1", 80, Scheme::Http).with_metadata(meta))
	}

	fn req() -> Request {
		http::Request::builder().body(crate::request::Body::empty()).unwrap()
	}

	#[test]
	fn distributes_by_weight_with_bounded_imbalance() {
		let a = instance("A", 1);
		let b = instance("B", 3);
		let snapshot: Snapshot = Arc::new(vec![a.clone(), b.clone()]);
		let lb = SmoothWeightedRoundRobin::new();
		let req = req();

		let mut counts: HashMap<String, u32> = HashMap::new();
		let mut max_run_same = 0u32;
		let mut last: Option<String> = None;
		let mut run = 0u32;
		for _ in 0..8 {
			let picked = lb.select(&snapshot, &req).unwrap();
			*counts.entry(picked.id.clone()).or_default() += 1;
			if last.as_deref() == Some(picked.id.as_str()) {
				run += 1;
			} else {
				run = 1;
			}
			max_run_same = max_run_same.max(run);
			last = Some(picked.id.clone());
		}
		assert_eq!(counts.get("A").copied().unwrap_or(0), 2);
		assert_eq!(counts.get("B").copied().unwrap_or(0), 6);
		// Smooth WRR never bursts the heavier instance more than (weight - 1) times in a row for
		// these weights.
		assert!(max_run_same <= 3, "unexpected burst: {max_run_same}");
	}

	#[test]
	fn no_healthy_instance_errors() {
		let a = instance("A", 1);
		a.set_healthy(false);
		let snapshot: Snapshot = Arc::new(vec![a]);
		let lb = SmoothWeightedRoundRobin::new();
		assert_eq!(lb.select(&snapshot, &req()), Err(BalancerError::NoHealthyInstance));
	}

	#[test]
	fn unhealthy_instance_excluded_after_rebuild() {
		let a = instance("A", 1);
		let b = instance("B", 1);
		let snapshot: Snapshot = Arc::new(vec![a.clone(), b.clone()]);
		let lb = SmoothWeightedRoundRobin::new();
		let req = req();
		let _ = lb.select(&snapshot, &req).unwrap();
		b.set_healthy(false);
		for _ in 0..5 {
			let picked = lb.select(&snapshot, &req).unwrap();
			assert_eq!(picked.id, "A");
		}
	}
}
