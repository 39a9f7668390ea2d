//! Dedicated event bus for sync observability
//!
//! Separate from the store lifecycle events so a slow subscriber to one never
//! lags the other. Events are informational: nothing in the sync engine
//! depends on whether anyone is listening.

use super::entry::OutboxEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Counts of what a sync cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
	pub succeeded: usize,
	/// Transient failures returned to the queue with a backoff
	pub retried: usize,
	/// Permanent failures
	pub failed: usize,
	pub abandoned: usize,
	/// Stale in-flight entries requeued by the startup sweep
	pub recovered: usize,
	/// Entries another cycle claimed first
	pub skipped: usize,
	/// Entries whose in-flight claim was lost before the outcome was recorded
	pub stale: usize,
}

impl SyncReport {
	/// Entries that reached an outcome this cycle
	pub fn attempted(&self) -> usize {
		self.succeeded + self.retried + self.failed + self.abandoned + self.stale
	}

	/// Whether the cycle found nothing to do
	pub fn is_empty(&self) -> bool {
		*self == Self::default()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
	CycleCompleted { report: SyncReport, cancelled: bool },

	/// An entry failed permanently and was handed to the failure policy
	EntryFailed { entry: OutboxEntry, error: String },

	/// An entry exhausted its retry budget
	EntryAbandoned { entry: OutboxEntry },

	/// Stale in-flight entries were requeued
	StaleRecovered { ids: Vec<String> },
}

impl SyncEvent {
	/// Stable name for logs and serialized events
	pub fn event_type(&self) -> &'static str {
		match self {
			SyncEvent::CycleCompleted { .. } => "CycleCompleted",
			SyncEvent::EntryFailed { .. } => "EntryFailed",
			SyncEvent::EntryAbandoned { .. } => "EntryAbandoned",
			SyncEvent::StaleRecovered { .. } => "StaleRecovered",
		}
	}

	/// Events the application is expected to surface to the user
	pub fn is_user_visible(&self) -> bool {
		matches!(
			self,
			SyncEvent::EntryFailed { .. } | SyncEvent::EntryAbandoned { .. }
		)
	}
}

#[derive(Debug, Clone)]
pub struct SyncEventBus {
	sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
	/// Bus with the default capacity
	pub fn new() -> Self {
		Self::with_capacity(1_024)
	}

	/// Bus keeping up to `capacity` events for slow subscribers
	pub fn with_capacity(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		debug!(capacity, "Created sync event bus");
		Self { sender }
	}

	/// Emits to every subscriber, returning how many received the event
	pub fn emit(&self, event: SyncEvent) -> usize {
		let event_type = event.event_type();
		match self.sender.send(event) {
			Ok(count) => {
				trace!(event_type, subscribers = count, "Sync event emitted");
				count
			}
			Err(_) => 0,
		}
	}

	/// Receives every event emitted after this call
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}

	/// Number of live receivers
	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for SyncEventBus {
	fn default() -> Self {
		Self::new()
	}
}
