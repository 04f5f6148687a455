//! Startup readiness tracking.
//!
//! Components that must finish initializing before the process reports ready register a task
//! name and get back a `BlockReady` guard; dropping the guard (normally, or on panic) marks that
//! task done. Readiness is "all clear" once the registered set is empty.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_task(&self, name: impl Into<String>) -> BlockReady {
		let name = name.into();
		self.0.lock().expect("mutex poisoned").insert(name.clone());
		BlockReady {
			parent: self.clone(),
			name: Some(name),
		}
	}

	pub fn pending(&self) -> Vec<String> {
		self.0.lock().expect("mutex poisoned").iter().cloned().collect()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().expect("mutex poisoned").is_empty()
	}
}

pub struct BlockReady {
	parent: Ready,
	name: Option<String>,
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		if let Some(name) = self.name.take() {
			let mut set = self.parent.0.lock().expect("mutex poisoned");
			set.remove(&name);
			tracing::debug!(task = %name, remaining = set.len(), "readiness task complete");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_after_all_tasks_drop() {
		let ready = Ready::new();
		let a = ready.register_task("a");
		let b = ready.register_task("b");
		assert!(!ready.is_ready());
		drop(a);
		assert!(!ready.is_ready());
		drop(b);
		assert!(ready.is_ready());
	}
}
