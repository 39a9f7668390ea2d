//! Initial store schema: the business collections

use crate::infra::db::{
	catalog::{MigrationStep, SchemaOp},
	schema::{CollectionSpec, IndexSpec},
};

pub(super) fn step() -> MigrationStep {
	MigrationStep::new(1, "initial_schema", "Create invoices and customers")
		.op(SchemaOp::CreateCollection(
			CollectionSpec::supplied("invoices", "id").index(IndexSpec::on_field("customerId")),
		))
		.op(SchemaOp::CreateCollection(CollectionSpec::supplied(
			"customers",
			"id",
		)))
}
