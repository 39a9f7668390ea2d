//! Connectivity collaborator
//!
//! The engine never checks the network itself. Whatever knows about the
//! network (OS callbacks, a health check, the UI) reports through a
//! [`ConnectivitySignal`], and the sync service reacts to its transitions.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub trait Connectivity: Send + Sync {
	fn is_online(&self) -> bool;

	/// Receiver of online state changes, starting at the current state
	fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Online state published through a watch channel
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
	sender: Arc<watch::Sender<bool>>,
}

impl ConnectivitySignal {
	/// Starts in the given connectivity state
	pub fn new(online: bool) -> Self {
		let (sender, _) = watch::channel(online);
		Self {
			sender: Arc::new(sender),
		}
	}

	/// Publishes a new state, returning whether it changed
	pub fn set_online(&self, online: bool) -> bool {
		let changed = self.sender.send_if_modified(|current| {
			if *current == online {
				false
			} else {
				*current = online;
				true
			}
		});

		if changed {
			info!(online, "Connectivity changed");
		}
		changed
	}
}

impl Connectivity for ConnectivitySignal {
	fn is_online(&self) -> bool {
		*self.sender.borrow()
	}

	fn subscribe(&self) -> watch::Receiver<bool> {
		self.sender.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_only_transitions_notify() {
		let signal = ConnectivitySignal::new(false);
		let mut receiver = signal.subscribe();

		assert!(!signal.set_online(false));
		assert!(signal.set_online(true));
		assert!(signal.is_online());

		receiver.changed().await.unwrap();
		assert!(*receiver.borrow_and_update());
		assert!(!receiver.has_changed().unwrap());
	}
}
