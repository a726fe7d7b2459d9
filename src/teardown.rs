use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A tree-shaped shutdown token. Tearing down a node tears down its
/// children; runtime services hold children of the runtime's root
/// token so the whole process winds down leaves-first.
#[derive(Clone)]
pub struct TeardownToken {
	inner: Arc<Node>,
}

struct Node {
	state: watch::Sender<Option<&'static str>>,
	children: Mutex<Vec<Arc<Node>>>,
}

impl TeardownToken {
	pub fn new() -> Self {
		Self {
			inner: Node::new(),
		}
	}

	pub fn teardown(&self, reason: &'static str) {
		self.inner.teardown(reason);
	}

	pub fn is_down(&self) -> bool {
		self.inner.state.borrow().is_some()
	}

	pub fn reason(&self) -> Option<&'static str> {
		*self.inner.state.borrow()
	}

	/// Resolves with the reason once the token (or an ancestor) is
	/// torn down.
	pub fn ended(&self) -> impl Future<Output = &'static str> + use<> {
		let mut rx = self.inner.state.subscribe();
		async move {
			match rx.wait_for(|state| state.is_some()).await {
				Ok(guard) => guard.unwrap_or("dropped"),
				// The sender dropped without a reason; treat it as an
				// orderly end.
				Err(_) => "dropped",
			}
		}
	}

	pub fn child(&self) -> TeardownToken {
		TeardownToken {
			inner: self.inner.child(),
		}
	}
}

impl Default for TeardownToken {
	fn default() -> Self {
		Self::new()
	}
}

impl Node {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			state: watch::Sender::new(None),
			children: Mutex::new(Vec::new()),
		})
	}

	fn child(self: &Arc<Self>) -> Arc<Self> {
		let mut children = self.children.lock();
		if self.state.borrow().is_some() {
			// Already down: the child is born down too.
			return self.clone();
		}
		let node = Node::new();
		children.push(node.clone());
		node
	}

	fn teardown(&self, reason: &'static str) {
		// Hold the lock so no child can attach mid-teardown.
		let children = self.children.lock();
		let first = self.state.send_if_modified(|state| {
			if state.is_none() {
				*state = Some(reason);
				true
			} else {
				false
			}
		});
		if first {
			for child in children.iter() {
				child.teardown(reason);
			}
		}
	}
}
