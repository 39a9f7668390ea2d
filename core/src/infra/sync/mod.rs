//! Sync infrastructure
//!
//! The outbox side of synchronization:
//! - Outbox entries and their status machine
//! - Outbox data access over the `syncQueue` collection
//! - Time source used for timestamps, backoff and stale detection
//! - Event bus for sync observability

pub mod entry;
pub mod event_bus;
pub mod queue;
pub mod time_source;

pub use entry::{EntryStatus, Operation, OutboxEntry, SYNC_QUEUE};
pub use event_bus::{SyncEvent, SyncEventBus, SyncReport};
pub use queue::{OutboxError, Staged, SyncQueue};
pub use time_source::{FakeTimeSource, SystemTimeSource, TimeSource};
