//! Store migrations shipped with the application
//!
//! One file per step, named after the date it was written. Steps are
//! immutable once released: changes go into a new step with the next version.

use super::catalog::{CatalogError, MigrationStep, SchemaCatalog};

mod m20260301_000001_initial_schema;
mod m20260415_000001_create_sync_queue;
mod m20260602_000001_rekey_sync_queue;
mod m20260920_000001_sync_queue_targets;

pub use m20260602_000001_rekey_sync_queue::QueueRecord;

/// Version the application opens its store at
pub const CURRENT_VERSION: u32 = 4;

/// Every step of the application store in version order
pub fn migrations() -> Vec<MigrationStep> {
	vec![
		m20260301_000001_initial_schema::step(),
		m20260415_000001_create_sync_queue::step(),
		m20260602_000001_rekey_sync_queue::step(),
		m20260920_000001_sync_queue_targets::step(),
	]
}

/// Catalog of every released step
pub fn standard_catalog() -> Result<SchemaCatalog, CatalogError> {
	SchemaCatalog::new(migrations())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_standard_catalog_is_valid() {
		let catalog = standard_catalog().unwrap();
		assert_eq!(catalog.current_version(), CURRENT_VERSION);
		assert_eq!(
			catalog.steps().iter().map(|step| step.name).collect::<Vec<_>>(),
			[
				"initial_schema",
				"create_sync_queue",
				"rekey_sync_queue",
				"sync_queue_targets"
			]
		);
	}
}
