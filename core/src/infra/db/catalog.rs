//! Schema catalog: the ordered list of migration steps describing a store
//!
//! The catalog is the declarative target state of the store at the current
//! software version. Each [`MigrationStep`] is stamped with the version it
//! upgrades the store to; steps are applied in ascending version order.

use super::{
	record::StoredRecord,
	schema::{validate_name, CollectionSpec, IndexSpec, KeyStrategy, SchemaError},
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Rewrites records whose shape predates the current one
///
/// Implementations decide structurally whether a record is old-shape, never by
/// store version alone: a store may have been created out of band.
pub trait RecordMigration: Send + Sync {
	/// Returns the upgraded record, or `None` when it already has the current shape
	fn upgrade(&self, record: &StoredRecord) -> Result<Option<Value>, String>;
}

/// A single schema or data change inside a migration step
#[derive(Clone)]
pub enum SchemaOp {
	/// Creates a collection with its declared indexes
	CreateCollection(CollectionSpec),

	/// Adds an index to an existing collection
	CreateIndex { collection: String, index: IndexSpec },

	/// Rewrites records in place; keys must not change
	RewriteRecords {
		collection: String,
		migration: Arc<dyn RecordMigration>,
	},

	/// Rebuilds a collection under a new key convention, rewriting every record
	ChangeKeyStrategy {
		collection: String,
		key_path: String,
		strategy: KeyStrategy,
		migration: Arc<dyn RecordMigration>,
	},
}

impl SchemaOp {
	/// Collection the operation touches
	pub fn collection(&self) -> &str {
		match self {
			Self::CreateCollection(spec) => &spec.name,
			Self::CreateIndex { collection, .. }
			| Self::RewriteRecords { collection, .. }
			| Self::ChangeKeyStrategy { collection, .. } => collection,
		}
	}

	fn validate(&self) -> Result<(), SchemaError> {
		match self {
			Self::CreateCollection(spec) => spec.validate(),
			Self::CreateIndex { collection, index } => {
				validate_name(collection)?;
				index.validate(collection)
			}
			Self::RewriteRecords { collection, .. } => validate_name(collection),
			Self::ChangeKeyStrategy {
				collection, key_path, ..
			} => {
				validate_name(collection)?;
				super::schema::validate_path(key_path)
			}
		}
	}
}

impl fmt::Debug for SchemaOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::CreateCollection(spec) => {
				f.debug_tuple("CreateCollection").field(&spec.name).finish()
			}
			Self::CreateIndex { collection, index } => f
				.debug_struct("CreateIndex")
				.field("collection", collection)
				.field("index", &index.name)
				.finish(),
			Self::RewriteRecords { collection, .. } => f
				.debug_struct("RewriteRecords")
				.field("collection", collection)
				.finish(),
			Self::ChangeKeyStrategy {
				collection,
				key_path,
				strategy,
				..
			} => f
				.debug_struct("ChangeKeyStrategy")
				.field("collection", collection)
				.field("key_path", key_path)
				.field("strategy", strategy)
				.finish(),
		}
	}
}

/// An immutable, versioned migration step
#[derive(Debug, Clone)]
pub struct MigrationStep {
	pub version: u32,
	pub name: &'static str,
	pub description: &'static str,
	pub ops: Vec<SchemaOp>,
}

impl MigrationStep {
	/// Empty step; add operations with [`MigrationStep::op`]
	pub fn new(version: u32, name: &'static str, description: &'static str) -> Self {
		Self {
			version,
			name,
			description,
			ops: Vec::new(),
		}
	}

	/// Appends a schema operation
	pub fn op(mut self, op: SchemaOp) -> Self {
		self.ops.push(op);
		self
	}
}

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error(
		"migration versions must start at 1 and strictly increase, found {found} after {previous}"
	)]
	OutOfOrder { previous: u32, found: u32 },

	#[error("migration step {version} ({name}) is invalid: {source}")]
	InvalidStep {
		version: u32,
		name: &'static str,
		#[source]
		source: SchemaError,
	},
}

/// Ordered, validated set of migration steps
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
	steps: Vec<MigrationStep>,
}

impl SchemaCatalog {
	/// Catalog of steps ordered by strictly increasing version
	pub fn new(steps: Vec<MigrationStep>) -> Result<Self, CatalogError> {
		let mut previous = 0;
		for step in &steps {
			if step.version <= previous {
				return Err(CatalogError::OutOfOrder {
					previous,
					found: step.version,
				});
			}
			previous = step.version;

			for op in &step.ops {
				op.validate().map_err(|source| CatalogError::InvalidStep {
					version: step.version,
					name: step.name,
					source,
				})?;
			}
		}

		Ok(Self { steps })
	}

	/// Version a store reaches after every step has run
	pub fn current_version(&self) -> u32 {
		self.steps.last().map(|step| step.version).unwrap_or(0)
	}

	/// All steps in version order
	pub fn steps(&self) -> &[MigrationStep] {
		&self.steps
	}

	/// Steps with `observed < version <= target`, ascending
	pub fn steps_between(
		&self,
		observed: u32,
		target: u32,
	) -> impl Iterator<Item = &MigrationStep> {
		self.steps
			.iter()
			.filter(move |step| step.version > observed && step.version <= target)
	}

	/// Whether `version` is one a store can be opened at
	pub fn declares(&self, version: u32) -> bool {
		version > 0 && version <= self.current_version()
	}
}
