//! Sync queue switches to caller-assigned string ids
//!
//! The first release keyed outbox entries by store-assigned integers, so an
//! entry re-created after a failure got a new id and the remote side could not
//! recognise the retry. Legacy entries also used `type`/`action` where the
//! current shape has `collection`/`operation`.

use crate::infra::db::{
	catalog::{MigrationStep, RecordMigration, SchemaOp},
	record::{RecordKey, StoredRecord},
	schema::KeyStrategy,
};
use crate::infra::sync::{EntryStatus, Operation, SYNC_QUEUE};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;

/// Shape of a stored outbox record
#[derive(Debug, Clone, PartialEq)]
pub enum QueueRecord {
	/// Integer-keyed entry from the first release
	V1 { seq: i64, body: Map<String, Value> },
	/// Entry with a caller-assigned string id
	V2,
}

impl QueueRecord {
	/// Classifies a record by the type of its id
	pub fn classify(record: &StoredRecord) -> Result<Self, String> {
		let body = record
			.value
			.as_object()
			.ok_or_else(|| "outbox record is not an object".to_string())?;

		let seq = match (body.get("id"), &record.key) {
			(Some(Value::String(_)), _) => return Ok(Self::V2),
			(Some(Value::Number(number)), _) => number
				.as_i64()
				.ok_or_else(|| format!("outbox id {number} is not an integer"))?,
			(None, RecordKey::Int(seq)) => *seq,
			(None, RecordKey::Text(_)) => return Ok(Self::V2),
			(Some(other), _) => return Err(format!("outbox id {other} has an unsupported type")),
		};

		Ok(Self::V1 {
			seq,
			body: body.clone(),
		})
	}

	/// Current-shape body, or `None` when already current
	pub fn upgrade(self) -> Result<Option<Value>, String> {
		let (seq, mut body) = match self {
			Self::V2 => return Ok(None),
			Self::V1 { seq, body } => (seq, body),
		};

		body.insert("id".to_string(), json!(format!("sync_{seq}")));

		let collection = match (body.remove("type"), body.get("collection")) {
			(_, Some(Value::String(collection))) => collection.clone(),
			(Some(Value::String(kind)), _) => kind,
			_ => return Err(format!("legacy outbox entry {seq} names no collection")),
		};
		body.insert("collection".to_string(), json!(collection));

		let operation = match (body.remove("action"), body.get("operation")) {
			(_, Some(Value::String(operation))) => operation.clone(),
			(Some(Value::String(action)), _) => action,
			_ => return Err(format!("legacy outbox entry {seq} has no operation")),
		};
		let operation = Operation::from_str(&operation.to_lowercase())
			.map_err(|_| format!("legacy outbox entry {seq} has unknown operation '{operation}'"))?;
		body.insert("operation".to_string(), json!(operation));

		let status = match body.get("status").and_then(Value::as_str) {
			Some("synced") => EntryStatus::Succeeded,
			Some(status) => EntryStatus::from_str(status).unwrap_or(EntryStatus::Pending),
			None => EntryStatus::Pending,
		};
		body.insert("status".to_string(), json!(status));

		let timestamp = match body.get("timestamp") {
			Some(Value::Number(number)) => number.as_i64().unwrap_or_default(),
			Some(Value::String(text)) => chrono::DateTime::parse_from_rfc3339(text)
				.map(|at| at.timestamp_millis())
				.unwrap_or_default(),
			_ => 0,
		};
		body.insert("timestamp".to_string(), json!(timestamp));

		body.entry("sequence").or_insert(json!(seq));
		body.entry("retryCount").or_insert(json!(0));
		body.entry("data").or_insert(json!({}));

		if !body.contains_key("recordKey") {
			let key = body
				.get("data")
				.and_then(|data| data.get("id"))
				.and_then(RecordKey::from_json);
			if let Some(key) = key {
				body.insert("recordKey".to_string(), key.to_json());
			}
		}

		Ok(Some(Value::Object(body)))
	}
}

struct RekeyQueue;

impl RecordMigration for RekeyQueue {
	fn upgrade(&self, record: &StoredRecord) -> Result<Option<Value>, String> {
		QueueRecord::classify(record)?.upgrade()
	}
}

pub(super) fn step() -> MigrationStep {
	MigrationStep::new(
		3,
		"rekey_sync_queue",
		"Key sync queue entries by caller-assigned string ids",
	)
	.op(SchemaOp::ChangeKeyStrategy {
		collection: SYNC_QUEUE.to_string(),
		key_path: "id".to_string(),
		strategy: KeyStrategy::Supplied,
		migration: Arc::new(RekeyQueue),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::{
		migration::standard_catalog,
		migrator::{MigrationEngine, MigrationError, StepError},
		table,
	};
	use sea_orm::Database;
	use tempfile::TempDir;

	fn legacy(seq: i64, value: Value) -> StoredRecord {
		StoredRecord {
			key: RecordKey::Int(seq),
			value,
		}
	}

	#[test]
	fn test_legacy_entry_upgrade() {
		let record = legacy(
			7,
			json!({
				"id": 7,
				"type": "invoices",
				"action": "CREATE",
				"data": {"id": "inv-9", "total": 120},
				"timestamp": 1_700_000_000_000i64,
				"deviceLabel": "front-desk"
			}),
		);

		let upgraded = RekeyQueue.upgrade(&record).unwrap().unwrap();
		assert_eq!(upgraded["id"], json!("sync_7"));
		assert_eq!(upgraded["collection"], json!("invoices"));
		assert_eq!(upgraded["operation"], json!("create"));
		assert_eq!(upgraded["status"], json!("pending"));
		assert_eq!(upgraded["retryCount"], json!(0));
		assert_eq!(upgraded["sequence"], json!(7));
		assert_eq!(upgraded["recordKey"], json!("inv-9"));
		assert_eq!(upgraded["deviceLabel"], json!("front-desk"));
		assert!(upgraded.get("type").is_none());
		assert!(upgraded.get("action").is_none());
	}

	#[test]
	fn test_current_entries_untouched() {
		let record = StoredRecord {
			key: RecordKey::from("sync_abc"),
			value: json!({"id": "sync_abc", "collection": "invoices", "operation": "update"}),
		};
		assert_eq!(QueueRecord::classify(&record).unwrap(), QueueRecord::V2);
		assert_eq!(RekeyQueue.upgrade(&record).unwrap(), None);
	}

	#[test]
	fn test_legacy_status_and_timestamp_normalised() {
		let record = legacy(
			2,
			json!({
				"id": 2,
				"type": "customers",
				"action": "update",
				"status": "synced",
				"timestamp": "2026-03-01T12:00:00Z",
				"retryCount": 2
			}),
		);

		let upgraded = RekeyQueue.upgrade(&record).unwrap().unwrap();
		assert_eq!(upgraded["status"], json!("succeeded"));
		assert_eq!(upgraded["retryCount"], json!(2));
		assert_eq!(upgraded["timestamp"], json!(1_772_366_400_000i64));
	}

	#[test]
	fn test_legacy_entry_without_type_is_rejected() {
		let record = legacy(3, json!({"id": 3, "action": "delete"}));
		assert!(RekeyQueue.upgrade(&record).is_err());
	}

	#[tokio::test]
	async fn test_rerun_refuses_to_merge_legacy_and_current_ids() {
		let temp = TempDir::new().unwrap();
		let url = format!("sqlite://{}?mode=rwc", temp.path().join("shop.db").display());
		let db = Database::connect(&url).await.unwrap();
		let catalog = standard_catalog().unwrap();
		let engine = MigrationEngine::new(&catalog);

		engine.apply_migrations(&db, 0, 3).await.unwrap();
		let schema = table::load_schema(&db).await.unwrap();
		let queue = &schema[SYNC_QUEUE];
		table::put(
			&db,
			queue,
			json!({"id": 7, "type": "invoices", "action": "create", "data": {"id": "inv-legacy"}}),
		)
		.await
		.unwrap();
		table::put(
			&db,
			queue,
			json!({"id": "sync_7", "collection": "customers", "operation": "update"}),
		)
		.await
		.unwrap();

		let err = engine.apply_migrations(&db, 2, 3).await.unwrap_err();
		assert_eq!(err.failed_step(), Some((3, "rekey_sync_queue")));
		assert!(matches!(
			err,
			MigrationError::Step {
				source: StepError::KeyCollision { .. },
				..
			}
		));

		let schema = table::load_schema(&db).await.unwrap();
		assert_eq!(table::scan(&db, &schema[SYNC_QUEUE]).await.unwrap().len(), 2);
	}
}
