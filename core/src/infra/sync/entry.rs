//! Outbox entries
//!
//! An entry is one change waiting to be replayed against the remote authority.
//! Entries are stored as JSON records in the `syncQueue` collection, keyed by
//! their caller-assigned id, so the same logical change keeps its identity
//! across retries and re-creation.

use super::queue::OutboxError;
use crate::infra::db::{RecordKey, StoredRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Collection backing the outbox
pub const SYNC_QUEUE: &str = "syncQueue";

/// Kind of change an entry replays
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
	Create,
	Update,
	Delete,
}

impl Operation {
	/// Operation left after `newer` is folded into a pending `self`
	///
	/// `None` means the two cancel out and no entry remains.
	pub fn coalesce(self, newer: Operation) -> Option<Operation> {
		match (self, newer) {
			(Operation::Create, Operation::Update) => Some(Operation::Create),
			(Operation::Create, Operation::Delete) => None,
			(_, newer) => Some(newer),
		}
	}
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	Serialize,
	Deserialize,
	Display,
	EnumString,
	AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryStatus {
	Pending,
	InFlight,
	Succeeded,
	Failed,
	Abandoned,
}

impl EntryStatus {
	pub const ALL: [EntryStatus; 5] = [
		EntryStatus::Pending,
		EntryStatus::InFlight,
		EntryStatus::Succeeded,
		EntryStatus::Failed,
		EntryStatus::Abandoned,
	];

	/// Pending and in-flight entries still have work ahead of them
	pub fn is_open(self) -> bool {
		matches!(self, EntryStatus::Pending | EntryStatus::InFlight)
	}

	/// Entries that will never be replayed again
	pub fn is_terminal(self) -> bool {
		!self.is_open()
	}

	/// `pending -> in_flight -> {succeeded | pending | failed}`, `failed -> abandoned`
	pub fn can_transition_to(self, next: EntryStatus) -> bool {
		use EntryStatus::*;

		matches!(
			(self, next),
			(Pending, InFlight)
				| (InFlight, Succeeded)
				| (InFlight, Pending)
				| (InFlight, Failed)
				| (Failed, Abandoned)
		)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
	pub id: String,

	/// Collection of the domain record this change belongs to
	pub collection: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub record_key: Option<RecordKey>,

	pub operation: Operation,

	#[serde(default)]
	pub data: Value,

	pub status: EntryStatus,

	#[serde(default)]
	pub retry_count: u32,

	/// Creation time in ms, the primary FIFO order
	#[serde(default)]
	pub timestamp: i64,

	/// Tie-breaker for entries created in the same millisecond
	#[serde(default)]
	pub sequence: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_attempt_at: Option<i64>,

	/// Token of the replay attempt holding the entry while it is in flight
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub claim: Option<String>,

	/// Earliest time the entry may be replayed again
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub not_before: Option<i64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote_id: Option<String>,

	/// Fields this version does not know about, kept verbatim
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl OutboxEntry {
	/// Pending entry stamped by the queue on enqueue
	pub fn new(
		id: impl Into<String>,
		collection: impl Into<String>,
		operation: Operation,
		data: Value,
	) -> Self {
		Self {
			id: id.into(),
			collection: collection.into(),
			record_key: None,
			operation,
			data,
			status: EntryStatus::Pending,
			retry_count: 0,
			timestamp: 0,
			sequence: 0,
			last_attempt_at: None,
			claim: None,
			not_before: None,
			last_error: None,
			remote_id: None,
			extra: Map::new(),
		}
	}

	/// Fresh id for a new logical change
	///
	/// Generate it once per user action and reuse it when the action is
	/// retried, so a repeated save updates the same entry.
	pub fn generate_id() -> String {
		format!("sync_{}", Uuid::new_v4())
	}

	/// Fresh token for one replay attempt
	pub fn generate_claim() -> String {
		Uuid::new_v4().to_string()
	}

	/// Ties the entry to the domain record it replays
	pub fn for_record(mut self, key: impl Into<RecordKey>) -> Self {
		self.record_key = Some(key.into());
		self
	}

	/// Collection and record key the entry writes to, if known
	pub fn target(&self) -> Option<(&str, &RecordKey)> {
		self.record_key
			.as_ref()
			.map(|key| (self.collection.as_str(), key))
	}

	/// Whether a scheduled retry may run at `now_ms`
	pub fn is_due(&self, now_ms: i64) -> bool {
		self.status == EntryStatus::Pending && self.not_before.map_or(true, |at| at <= now_ms)
	}

	/// Moves the entry to `next`, rejecting anything outside the status machine
	pub fn transition(&mut self, next: EntryStatus) -> Result<(), OutboxError> {
		if !self.status.can_transition_to(next) {
			return Err(OutboxError::InvalidTransition {
				id: self.id.clone(),
				from: self.status,
				to: next,
			});
		}
		self.status = next;
		Ok(())
	}

	pub(crate) fn to_value(&self) -> Result<Value, OutboxError> {
		serde_json::to_value(self).map_err(|source| OutboxError::Encode {
			id: self.id.clone(),
			source,
		})
	}

	pub(crate) fn from_record(record: &StoredRecord) -> Result<Self, OutboxError> {
		serde_json::from_value(record.value.clone()).map_err(|source| OutboxError::Decode {
			key: record.key.clone(),
			source,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_generated_ids_are_distinct() {
		let first = OutboxEntry::generate_id();
		let second = OutboxEntry::generate_id();
		assert!(first.starts_with("sync_"));
		assert_ne!(first, second);
	}

	#[test]
	fn test_status_machine() {
		use EntryStatus::*;

		for from in EntryStatus::ALL {
			for to in EntryStatus::ALL {
				let allowed = from.can_transition_to(to);
				let expected = matches!(
					(from, to),
					(Pending, InFlight)
						| (InFlight, Succeeded)
						| (InFlight, Pending)
						| (InFlight, Failed)
						| (Failed, Abandoned)
				);
				assert_eq!(allowed, expected, "{from} -> {to}");
			}
		}

		assert!(Pending.is_open());
		assert!(InFlight.is_open());
		assert!(Failed.is_terminal());
	}

	#[test]
	fn test_invalid_transition_is_an_error() {
		let mut entry = OutboxEntry::new("sync_1", "invoices", Operation::Create, json!({}));
		assert!(matches!(
			entry.transition(EntryStatus::Succeeded),
			Err(OutboxError::InvalidTransition {
				from: EntryStatus::Pending,
				to: EntryStatus::Succeeded,
				..
			})
		));

		entry.transition(EntryStatus::InFlight).unwrap();
		entry.transition(EntryStatus::Failed).unwrap();
		entry.transition(EntryStatus::Abandoned).unwrap();
		assert_eq!(entry.status, EntryStatus::Abandoned);
	}

	#[test]
	fn test_coalescing() {
		use Operation::*;

		assert_eq!(Create.coalesce(Update), Some(Create));
		assert_eq!(Create.coalesce(Delete), None);
		assert_eq!(Update.coalesce(Update), Some(Update));
		assert_eq!(Update.coalesce(Delete), Some(Delete));
		assert_eq!(Delete.coalesce(Create), Some(Create));
	}

	#[test]
	fn test_wire_shape_and_unknown_fields() {
		let value = json!({
			"id": "sync_abc",
			"collection": "invoices",
			"recordKey": "inv-1",
			"operation": "update",
			"data": {"total": 10},
			"status": "in_flight",
			"retryCount": 2,
			"timestamp": 1000,
			"sequence": 3,
			"deviceName": "till-2"
		});

		let entry: OutboxEntry = serde_json::from_value(value.clone()).unwrap();
		assert_eq!(entry.operation, Operation::Update);
		assert_eq!(entry.status, EntryStatus::InFlight);
		assert_eq!(entry.target(), Some(("invoices", &RecordKey::from("inv-1"))));
		assert_eq!(entry.extra["deviceName"], json!("till-2"));

		assert_eq!(serde_json::to_value(&entry).unwrap(), value);
	}

	#[test]
	fn test_due_respects_not_before() {
		let mut entry = OutboxEntry::new("sync_1", "invoices", Operation::Create, json!({}));
		assert!(entry.is_due(0));

		entry.not_before = Some(5_000);
		assert!(!entry.is_due(4_999));
		assert!(entry.is_due(5_000));
	}
}
