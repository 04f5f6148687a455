//! Load Balancer (spec §4.2): selects one healthy instance from a service's snapshot under a
//! configured policy.

pub mod smooth_wrr;
pub mod sticky;
pub mod weighted_random;

use std::sync::Arc;

use crate::registry::{ServiceInstance, Snapshot};
use crate::request::Request;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BalancerError {
	#[error("no healthy instance available")]
	NoHealthyInstance,
}

/// Implementors only ever hand back instances with `healthy() == true` (spec §3 invariant);
/// selection is O(n) in the instance count, which is acceptable for the expected n <= 1e3 (spec
/// §4.2).
pub trait LoadBalancer: Send + Sync {
	/// Select an instance given the current snapshot and the request driving selection (used by
	/// the sticky wrapper to extract a session key; stateless policies ignore `request`).
	fn select(&self, snapshot: &Snapshot, request: &Request) -> Result<Arc<ServiceInstance>, BalancerError>;
}

pub(crate) fn healthy_iter(snapshot: &Snapshot) -> impl Iterator<Item = &Arc<ServiceInstance>> {
	snapshot.iter().filter(|i| i.healthy())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
	SmoothWeightedRoundRobin,
	WeightedRandom,
}

pub fn build(policy: Policy) -> Arc<dyn LoadBalancer> {
	match policy {
		Policy::SmoothWeightedRoundRobin => Arc::new(smooth_wrr::SmoothWeightedRoundRobin::new()),
		Policy::WeightedRandom => Arc::new(weighted_random::WeightedRandom),
	}
}
