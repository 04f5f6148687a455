//! Session Store (spec §3, §4.2): in-memory LRU+TTL mapping session-id -> instance-id, bounded at
//! a configurable capacity, swept for expired entries every 60s by a single background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionEntry {
	pub session_id: String,
	pub instance_id: String,
	pub expires_at: Instant,
}

struct Inner {
	entries: HashMap<String, SessionEntry>,
	/// Access order, most-recently-used at the back. Used for the "least-recently-accessed"
	/// eviction tie-break once expiry alone doesn't free space.
	lru: Vec<String>,
	capacity: usize,
}

impl Inner {
	fn touch(&mut self, session_id: &str) {
		if let Some(pos) = self.lru.iter().position(|id| id == session_id) {
			self.lru.remove(pos);
		}
		self.lru.push(session_id.to_string());
	}

	fn evict_if_needed(&mut self) {
		while self.entries.len() > self.capacity {
			// expire-first: prefer evicting an already-expired entry even if it isn't the LRU
			// head, then fall back to least-recently-accessed.
			let now = Instant::now();
			let expired_key = self.entries.iter().find(|(_, v)| v.expires_at <= now).map(|(k, _)| k.clone());
			let victim = expired_key.or_else(|| self.lru.first().cloned());
			let Some(victim) = victim else { break };
			self.entries.remove(&victim);
			self.lru.retain(|id| id != &victim);
		}
	}
}

pub struct SessionStore {
	inner: Mutex<Inner>,
	sweep_cancel: CancellationToken,
}

impl SessionStore {
	pub fn new(capacity: usize) -> Arc<Self> {
		let store = Arc::new(Self {
			inner: Mutex::new(Inner {
				entries: HashMap::new(),
				lru: Vec::new(),
				capacity,
			}),
			sweep_cancel: CancellationToken::new(),
		});
		// Only spawn the sweeper when a Tokio runtime is actually driving us; plain `#[test]`
		// construction (no runtime) must not panic, and has nothing to sweep anyway.
		if tokio::runtime::Handle::try_current().is_ok() {
			store.clone().spawn_sweeper(Duration::from_secs(60));
		}
		store
	}

	fn spawn_sweeper(self: Arc<Self>, interval: Duration) {
		let cancel = self.sweep_cancel.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = tick.tick() => {}
				}
				self.sweep();
			}
		});
	}

	fn sweep(&self) {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		let expired: Vec<String> = inner
			.entries
			.iter()
			.filter(|(_, v)| v.expires_at <= now)
			.map(|(k, _)| k.clone())
			.collect();
		for key in expired {
			inner.entries.remove(&key);
			inner.lru.retain(|id| id != &key);
		}
	}

	/// Returns the mapped instance id if present and not expired. A hit refreshes LRU position;
	/// the caller is responsible for checking the target instance is still healthy and calling
	/// `remove` if not (spec §3: "discarded the moment its instance... becomes unhealthy").
	pub fn get(&self, session_id: &str) -> Option<String> {
		let mut inner = self.inner.lock();
		let now = Instant::now();
		let hit = inner.entries.get(session_id).filter(|e| e.expires_at > now).map(|e| e.instance_id.clone());
		if hit.is_some() {
			inner.touch(session_id);
		} else if inner.entries.contains_key(session_id) {
			inner.entries.remove(session_id);
		}
		hit
	}

	pub fn insert(&self, session_id: String, instance_id: String, ttl: Duration) {
		let mut inner = self.inner.lock();
		inner.entries.insert(
			session_id.clone(),
			SessionEntry {
				session_id: session_id.clone(),
				instance_id,
				expires_at: Instant::now() + ttl,
			},
		);
		inner.touch(&session_id);
		inner.evict_if_needed();
	}

	pub fn remove(&self, session_id: &str) {
		let mut inner = self.inner.lock();
		inner.entries.remove(session_id);
		inner.lru.retain(|id| id != session_id);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn stop(&self) {
		self.sweep_cancel.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn expired_entries_are_not_returned() {
		let store = SessionStore::new(10);
		store.insert("s1".into(), "inst-a".into(), Duration::from_millis(1));
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(store.get("s1"), None);
	}

	#[test]
	fn capacity_bound_evicts() {
		let store = SessionStore::new(2);
		store.insert("s1".into(), "a".into(), Duration::from_secs(60));
		store.insert("s2".into(), "b".into(), Duration::from_secs(60));
		store.insert("s3".into(), "c".into(), Duration::from_secs(60));
		assert!(store.len() <= 2);
		// s1 was least-recently-used and should have been evicted first.
		assert_eq!(store.get("s1"), None);
		assert_eq!(store.get("s3"), Some("c".into()));
	}

	#[test]
	fn remove_discards_mapping() {
		let store = SessionStore::new(10);
		store.insert("s1".into(), "a".into(), Duration::from_secs(60));
		store.remove("s1");
		assert_eq!(store.get("s1"), None);
	}
}
