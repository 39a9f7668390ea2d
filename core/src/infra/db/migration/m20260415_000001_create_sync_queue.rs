//! Outbox collection
//!
//! Released with store-assigned integer keys; see the rekey step that followed.

use crate::infra::db::{
	catalog::{MigrationStep, SchemaOp},
	schema::{CollectionSpec, IndexSpec},
};
use crate::infra::sync::SYNC_QUEUE;

pub(super) fn step() -> MigrationStep {
	MigrationStep::new(2, "create_sync_queue", "Create the sync queue")
		.op(SchemaOp::CreateCollection(
			CollectionSpec::sequential(SYNC_QUEUE, "id")
				.index(IndexSpec::on_field("timestamp"))
				.index(IndexSpec::on_field("retryCount"))
				.index(IndexSpec::on_field("status")),
		))
}
