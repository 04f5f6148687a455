//! Service Registry (spec §4.1): maps a service name to an ordered set of instances with health
//! state. Readers always see an immutable snapshot so downstream balancers never mutate shared
//! state.

pub mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
	Http,
	Https,
	Grpc,
	Ws,
	Wss,
}

impl Scheme {
	pub fn as_str(self) -> &'static str {
		match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
			Scheme::Grpc => "grpc",
			Scheme::Ws => "ws",
			Scheme::Wss => "wss",
		}
	}
}

/// One backend instance of a named service. `Healthy` is mutated only by the Health Monitor or a
/// registry reload; every other reader sees a consistent snapshot via `Arc<ServiceInstance>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
	pub id: String,
	pub address: String,
	pub port: u16,
	pub scheme: Scheme,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
	#[serde(skip, default = "default_healthy")]
	healthy: Arc<AtomicBool>,
}

fn default_healthy() -> Arc<AtomicBool> {
	Arc::new(AtomicBool::new(true))
}

impl ServiceInstance {
	pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16, scheme: Scheme) -> Self {
		Self {
			id: id.into(),
			address: address.into(),
			port,
			scheme,
			metadata: HashMap::new(),
			healthy: default_healthy(),
		}
	}

	pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
		self.metadata = metadata;
		self
	}

	pub fn healthy(&self) -> bool {
		self.healthy.load(Ordering::Acquire)
	}

	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::Release);
	}

	/// Weight used by the load balancer, read from `metadata["weight"]`. Accepts integers or
	/// floats, defaults to 1 for missing/unparseable values, floored at 0.
	pub fn weight(&self) -> f64 {
		self
			.metadata
			.get("weight")
			.and_then(|w| w.parse::<f64>().ok())
			.filter(|w| *w >= 0.0)
			.unwrap_or(1.0)
	}

	pub fn base_url(&self) -> String {
		format!("{}://{}:{}", self.scheme.as_str(), self.address, self.port)
	}
}

/// A point-in-time, immutable copy of a service's instance list. Cloning is cheap: it's a
/// `Vec<Arc<ServiceInstance>>`.
pub type Snapshot = Arc<Vec<Arc<ServiceInstance>>>;

pub trait Registry: Send + Sync {
	fn get_instances(&self, service_name: &str) -> Snapshot;
	fn subscribe(&self, service_name: &str) -> watch::Receiver<Snapshot>;
	fn service_names(&self) -> Vec<String>;
}

/// A static, health-aware registry: instance membership comes from configuration (or a reload),
/// health bits are flipped in place by `registry::health::HealthMonitor`.
pub struct StaticRegistry {
	services: RwLock<HashMap<String, (Snapshot, watch::Sender<Snapshot>)>>,
}

impl StaticRegistry {
	pub fn new() -> Self {
		Self {
			services: RwLock::new(HashMap::new()),
		}
	}

	pub fn from_config(config: HashMap<String, Vec<ServiceInstance>>) -> Self {
		let reg = Self::new();
		for (name, instances) in config {
			reg.replace(&name, instances);
		}
		reg
	}

	/// Atomically replaces a service's instance list, matching spec §4.1's copy-on-read policy:
	/// existing `Snapshot` holders are unaffected; new readers (and subscribers) see the update.
	pub fn replace(&self, service_name: &str, instances: Vec<ServiceInstance>) {
		let snapshot: Snapshot = Arc::new(instances.into_iter().map(Arc::new).collect());
		let mut services = self.services.write();
		match services.get(service_name) {
			Some((_, tx)) => {
				let _ = tx.send(snapshot.clone());
				services.insert(service_name.to_string(), (snapshot, tx.clone()));
			},
			None => {
				let (tx, _rx) = watch::channel(snapshot.clone());
				services.insert(service_name.to_string(), (snapshot, tx));
			},
		}
	}

	pub fn instance(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
		self
			.get_instances(service_name)
			.iter()
			.find(|i| i.id == instance_id)
			.cloned()
	}
}

impl Default for StaticRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry for StaticRegistry {
	fn get_instances(&self, service_name: &str) -> Snapshot {
		self
			.services
			.read()
			.get(service_name)
			.map(|(snapshot, _)| snapshot.clone())
			.unwrap_or_else(|| Arc::new(Vec::new()))
	}

	fn subscribe(&self, service_name: &str) -> watch::Receiver<Snapshot> {
		let mut services = self.services.write();
		let entry = services
			.entry(service_name.to_string())
			.or_insert_with(|| watch::channel(Arc::new(Vec::new())))
			.clone();
		entry.1.subscribe()
	}

	fn service_names(&self) -> Vec<String> {
		self.services.read().keys().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_is_stable_after_replace() {
		let reg = StaticRegistry::new();
		reg.replace("users", vec![ServiceInstance::new("a", "10.0.0.1", 8080, Scheme::Http)]);
		let snap1 = reg.get_instances("users");
		reg.replace("users", vec![ServiceInstance::new("b", "10.0.0.2", 8080, Scheme::Http)]);
		let snap2 = reg.get_instances("users");
		assert_eq!(snap1.len(), 1);
		assert_eq!(snap1[0].id, "a");
		assert_eq!(snap2[0].id, "b");
	}

	#[test]
	fn unknown_service_returns_empty() {
		let reg = StaticRegistry::new();
		assert!(reg.get_instances("missing").is_empty());
	}

	#[test]
	fn weight_defaults_to_one() {
		let inst = ServiceInstance::new("a", "10.0.0.1", 80, Scheme::Http);
		assert_eq!(inst.weight(), 1.0);
		let mut meta = HashMap::new();
		meta.insert("weight".to_string(), "3".to_string());
		let inst = inst.with_metadata(meta);
		assert_eq!(inst.weight(), 3.0);
	}
}
