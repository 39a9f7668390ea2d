//! Per-record outbox lookups and the `synced` flag on business records

use crate::infra::db::{
	catalog::{MigrationStep, RecordMigration, SchemaOp},
	record::StoredRecord,
	schema::{IndexSpec, KeyPath},
};
use crate::infra::sync::SYNC_QUEUE;
use serde_json::Value;
use std::sync::Arc;

/// Adds `synced: false` to records written before the flag existed
struct BackfillSynced;

impl RecordMigration for BackfillSynced {
	fn upgrade(&self, record: &StoredRecord) -> Result<Option<Value>, String> {
		let Some(body) = record.value.as_object() else {
			return Err("record is not an object".to_string());
		};
		if body.contains_key("synced") {
			return Ok(None);
		}

		let mut body = body.clone();
		body.insert("synced".to_string(), Value::Bool(false));
		Ok(Some(Value::Object(body)))
	}
}

pub(super) fn step() -> MigrationStep {
	let backfill: Arc<dyn RecordMigration> = Arc::new(BackfillSynced);

	MigrationStep::new(
		4,
		"sync_queue_targets",
		"Index outbox entries by target record and flag unsynced records",
	)
	.op(SchemaOp::CreateIndex {
		collection: SYNC_QUEUE.to_string(),
		index: IndexSpec::new("target", KeyPath::compound(["collection", "recordKey"])),
	})
	.op(SchemaOp::CreateIndex {
		collection: SYNC_QUEUE.to_string(),
		index: IndexSpec::on_field("notBefore"),
	})
	.op(SchemaOp::RewriteRecords {
		collection: "invoices".to_string(),
		migration: backfill.clone(),
	})
	.op(SchemaOp::RewriteRecords {
		collection: "customers".to_string(),
		migration: backfill,
	})
}
