//! Weighted random selection (spec §4.2): pick uniformly in `[0, total_weight)` and walk the
//! healthy prefix-sum. Grounded on the teacher's `httpproxy.rs::load_balance`, which performs the
//! same prefix-sum walk over workload capacity weights using `rand`.

use std::sync::Arc;

use rand::Rng;

use super::{BalancerError, LoadBalancer, healthy_iter};
use crate::registry::{ServiceInstance, Snapshot};
use crate::request::Request;

pub struct WeightedRandom;

impl LoadBalancer for WeightedRandom {
	fn select(&self, snapshot: &Snapshot, _request: &Request) -> Result<Arc<ServiceInstance>, BalancerError> {
		let healthy: Vec<&Arc<ServiceInstance>> = healthy_iter(snapshot).collect();
		if healthy.is_empty() {
			return Err(BalancerError::NoHealthyInstance);
		}
		let total: f64 = healthy.iter().map(|i| i.weight()).sum();
		if total <= 0.0 {
			// All weights are zero: fall back to uniform selection over the healthy set.
			let idx = rand::rng().random_range(0..healthy.len());
			return Ok(healthy[idx].clone());
		}
		let mut pick = rand::rng().random_range(0.0..total);
		for inst in &healthy {
			let w = inst.weight();
			if pick < w {
				return Ok((*inst).clone());
			}
			pick -= w;
		}
		// Floating-point rounding can leave `pick` just shy of `total`; fall back to the last
		// entry rather than erroring.
		Ok(healthy[healthy.len() - 1].clone())
	}
}
