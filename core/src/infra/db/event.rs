//! Store lifecycle events
//!
//! Published by the [`StoreManager`](super::StoreManager) so the application
//! can react to upgrades and to other connections holding a store open at an
//! older version (for instance by asking the user to close another session).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
	/// The on-disk version is behind the requested one and an upgrade will run
	UpgradeNeeded {
		store: String,
		old_version: u32,
		new_version: u32,
	},

	/// The upgrade transaction committed
	Upgraded {
		store: String,
		old_version: u32,
		new_version: u32,
	},

	/// Open handles at a lower version are preventing an upgrade
	Blocked {
		store: String,
		holders: usize,
		requested_version: u32,
	},

	/// An open handle was asked to close so the store can be upgraded
	VersionChange {
		store: String,
		old_version: u32,
		new_version: u32,
	},

	Closed { store: String, version: u32 },
}

impl StoreEvent {
	/// Name of the store the event is about
	pub fn store(&self) -> &str {
		match self {
			Self::UpgradeNeeded { store, .. }
			| Self::Upgraded { store, .. }
			| Self::Blocked { store, .. }
			| Self::VersionChange { store, .. }
			| Self::Closed { store, .. } => store,
		}
	}
}

/// Request delivered to a handle when another open wants to upgrade past it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChangeRequest {
	pub old_version: u32,
	pub new_version: u32,
}

/// Broadcast bus for [`StoreEvent`]s
#[derive(Debug, Clone)]
pub struct StoreEventBus {
	sender: broadcast::Sender<StoreEvent>,
}

impl StoreEventBus {
	/// Bus keeping up to `capacity` events for slow subscribers
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Emits an event, returning how many subscribers received it
	pub fn emit(&self, event: StoreEvent) -> usize {
		trace!(?event, "Store event");
		self.sender.send(event).unwrap_or(0)
	}

	/// Receives every event emitted after this call
	pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
		self.sender.subscribe()
	}

	/// Number of live receivers
	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for StoreEventBus {
	fn default() -> Self {
		Self::new(256)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_events_reach_every_subscriber() {
		let bus = StoreEventBus::default();
		let closed = StoreEvent::Closed {
			store: "app".into(),
			version: 1,
		};
		assert_eq!(bus.emit(closed), 0);

		let mut first = bus.subscribe();
		let mut second = bus.subscribe();
		let event = StoreEvent::Upgraded {
			store: "app".into(),
			old_version: 1,
			new_version: 2,
		};

		assert_eq!(bus.emit(event.clone()), 2);
		assert_eq!(first.recv().await.unwrap(), event);
		assert_eq!(second.recv().await.unwrap().store(), "app");
	}

	#[test]
	fn test_event_serializes_with_type_tag() {
		let value = serde_json::to_value(StoreEvent::Blocked {
			store: "app".into(),
			holders: 2,
			requested_version: 3,
		})
		.unwrap();

		assert_eq!(value["type"], "blocked");
		assert_eq!(value["holders"], 2);
	}
}
