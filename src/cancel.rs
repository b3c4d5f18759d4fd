use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Why an instance or connection task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	/// The whole runtime is draining.
	Shutdown,
	/// This task alone was closed, e.g. a connection kicked by the server.
	Closed,
}

/// Hierarchical stop signal.
///
/// Stopping a token stops every child created from it; children created from
/// an already stopped token start stopped.
#[derive(Clone)]
pub struct StopToken {
	inner: Arc<Node>,
}

struct Node {
	state: watch::Sender<Option<StopReason>>,
	children: Mutex<Vec<Arc<Node>>>,
}

impl Default for StopToken {
	fn default() -> Self {
		Self::new()
	}
}

impl Debug for StopToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StopToken")
			.field("reason", &*self.inner.state.borrow())
			.finish()
	}
}

impl StopToken {
	pub fn new() -> Self {
		Self {
			inner: Node::new(),
		}
	}

	pub fn child(&self) -> StopToken {
		// locking to prevent a concurrent stop from missing the new child
		let mut children = self.inner.children.lock();
		let node = Node::new();
		match *self.inner.state.borrow() {
			Some(reason) => {
				node.state.send_replace(Some(reason));
			}
			None => {
				children.retain(|child| Arc::strong_count(child) > 1);
				children.push(node.clone());
			}
		}
		StopToken { inner: node }
	}

	pub fn stop(&self, reason: StopReason) {
		self.inner.stop(reason)
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.state.borrow().is_some()
	}

	pub fn reason(&self) -> Option<StopReason> {
		*self.inner.state.borrow()
	}

	/// Resolves once the token (or one of its ancestors) is stopped.
	pub fn stopped(&self) -> impl Future<Output = StopReason> + Send + 'static {
		let mut recv = self.inner.state.subscribe();
		async move {
			let result = recv.wait_for(|state| state.is_some()).await;
			match result.as_deref() {
				Ok(Some(reason)) => *reason,
				// the sender lives as long as any token, so this only
				// happens while everything is being torn down
				_ => StopReason::Shutdown,
			}
		}
	}
}

impl Node {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			state: watch::Sender::new(None),
			children: Mutex::new(Vec::new()),
		})
	}

	fn stop(&self, reason: StopReason) {
		let children = self.children.lock();

		let changed = self.state.send_if_modified(|state| match state {
			None => {
				*state = Some(reason);
				true
			}
			// do not re-stop
			Some(_) => false,
		});

		if changed {
			for child in children.iter() {
				child.stop(reason);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn stopping_parent_stops_children() {
		let root = StopToken::new();
		let child = root.child();
		let grandchild = child.child();

		root.stop(StopReason::Shutdown);

		let reason = tokio::time::timeout(Duration::from_secs(1), grandchild.stopped())
			.await
			.unwrap();
		assert_eq!(reason, StopReason::Shutdown);
		assert!(child.is_stopped());
	}

	#[tokio::test]
	async fn stopping_child_leaves_parent_running() {
		let root = StopToken::new();
		let child = root.child();
		child.stop(StopReason::Closed);
		assert!(!root.is_stopped());
		assert_eq!(child.reason(), Some(StopReason::Closed));
	}

	#[test]
	fn child_of_stopped_token_starts_stopped() {
		let root = StopToken::new();
		root.stop(StopReason::Shutdown);
		assert_eq!(root.child().reason(), Some(StopReason::Shutdown));
	}
}
