//! Migration engine
//!
//! Closes the gap between the version stamped on a store and a target version
//! by running every catalog step in between inside one upgrade transaction.
//! A failing step aborts the whole transaction, leaving the store exactly as
//! it was before the upgrade started.
//!
//! Every operation checks the current state before acting, so re-running a
//! step against a store where it (partially) ran already is a no-op.

use super::{
	catalog::{MigrationStep, RecordMigration, SchemaCatalog, SchemaOp},
	record::RecordKey,
	schema::{quote_ident, side_table_name, CollectionInfo, CollectionSpec, IndexSpec, KeyStrategy},
	scope::TxError,
	table,
};
use sea_orm::{
	ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, Statement,
	TransactionTrait,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum MigrationError {
	#[error("cannot migrate from version {observed} down to {target}")]
	InvalidRange { observed: u32, target: u32 },

	#[error("version {target} is not declared by the catalog (latest is {latest})")]
	UnknownTarget { target: u32, latest: u32 },

	#[error("migration step {version} ({name}) failed: {source}")]
	Step {
		version: u32,
		name: &'static str,
		#[source]
		source: StepError,
	},

	#[error("database error during migration: {0}")]
	Database(#[from] DbErr),
}

impl MigrationError {
	/// Version of the step that failed, if a step failed
	pub fn failed_step(&self) -> Option<(u32, &'static str)> {
		match self {
			Self::Step { version, name, .. } => Some((*version, name)),
			_ => None,
		}
	}
}

/// Reasons a single migration step can fail
#[derive(Debug, Error)]
pub enum StepError {
	#[error("collection {0} does not exist")]
	UnknownCollection(String),

	#[error("record {key} in {collection} could not be upgraded: {reason}")]
	Record {
		collection: String,
		key: RecordKey,
		reason: String,
	},

	#[error("record {key} in {collection} changed key during an in-place rewrite")]
	KeyChanged { collection: String, key: RecordKey },

	#[error("records {first} and {second} in {collection} both map to key {key}")]
	KeyCollision {
		collection: String,
		key: RecordKey,
		first: RecordKey,
		second: RecordKey,
	},

	#[error(transparent)]
	Store(#[from] TxError),
}

impl From<DbErr> for StepError {
	fn from(err: DbErr) -> Self {
		Self::Store(TxError::Database(err))
	}
}

/// Reads the version stamped on the store
pub async fn read_version<C: ConnectionTrait>(conn: &C) -> Result<u32, DbErr> {
	let row = conn
		.query_one(Statement::from_string(
			DbBackend::Sqlite,
			"PRAGMA user_version".to_string(),
		))
		.await?;

	let version = match row {
		Some(row) => row.try_get::<i64>("", "user_version")?,
		None => 0,
	};

	u32::try_from(version).map_err(|_| DbErr::Type(format!("invalid store version {version}")))
}

async fn write_version<C: ConnectionTrait>(conn: &C, version: u32) -> Result<(), DbErr> {
	// PRAGMA does not take bound parameters; the value is a plain integer
	conn.execute_unprepared(&format!("PRAGMA user_version = {version}"))
		.await?;
	Ok(())
}

/// Applies catalog steps to a store
pub struct MigrationEngine<'a> {
	catalog: &'a SchemaCatalog,
}

impl<'a> MigrationEngine<'a> {
	/// Engine applying the steps of `catalog`
	pub fn new(catalog: &'a SchemaCatalog) -> Self {
		Self { catalog }
	}

	fn check_range(&self, observed: u32, target: u32) -> Result<(), MigrationError> {
		if observed > target {
			return Err(MigrationError::InvalidRange { observed, target });
		}
		if target > self.catalog.current_version() {
			return Err(MigrationError::UnknownTarget {
				target,
				latest: self.catalog.current_version(),
			});
		}
		Ok(())
	}

	/// Runs every step with `observed < version <= target` in one transaction
	/// and stamps the store with `target`
	///
	/// Equal versions are a successful no-op.
	pub async fn apply_migrations(
		&self,
		db: &DatabaseConnection,
		observed: u32,
		target: u32,
	) -> Result<(), MigrationError> {
		self.check_range(observed, target)?;
		if observed == target {
			return Ok(());
		}

		let txn = db.begin().await?;
		match self.run_steps(&txn, observed, target).await {
			Ok(()) => {
				write_version(&txn, target).await?;
				txn.commit().await?;
				Ok(())
			}
			Err(e) => {
				txn.rollback().await?;
				Err(e)
			}
		}
	}

	/// Upgrades the store to `target`, reading the starting version inside the
	/// upgrade transaction. Returns the version the store was at.
	pub(crate) async fn upgrade(
		&self,
		db: &DatabaseConnection,
		target: u32,
	) -> Result<u32, MigrationError> {
		let txn = db.begin().await?;
		let observed = read_version(&txn).await?;

		if observed >= target {
			txn.rollback().await?;
			return Ok(observed);
		}

		if let Err(e) = self.check_range(observed, target) {
			txn.rollback().await?;
			return Err(e);
		}

		match self.run_steps(&txn, observed, target).await {
			Ok(()) => {
				write_version(&txn, target).await?;
				txn.commit().await?;
				Ok(observed)
			}
			Err(e) => {
				txn.rollback().await?;
				Err(e)
			}
		}
	}

	async fn run_steps(
		&self,
		txn: &DatabaseTransaction,
		observed: u32,
		target: u32,
	) -> Result<(), MigrationError> {
		table::ensure_meta_tables(txn).await?;

		for step in self.catalog.steps_between(observed, target) {
			info!(
				version = step.version,
				name = step.name,
				description = step.description,
				"Applying migration step"
			);

			if let Err(source) = apply_step(txn, step).await {
				error!(
					version = step.version,
					name = step.name,
					error = %source,
					"Migration step failed, rolling back upgrade"
				);
				return Err(MigrationError::Step {
					version: step.version,
					name: step.name,
					source,
				});
			}
		}

		Ok(())
	}
}

async fn apply_step(txn: &DatabaseTransaction, step: &MigrationStep) -> Result<(), StepError> {
	for op in &step.ops {
		match op {
			SchemaOp::CreateCollection(spec) => create_collection(txn, spec, step.version).await?,
			SchemaOp::CreateIndex { collection, index } => {
				create_index(txn, collection, index).await?
			}
			SchemaOp::RewriteRecords {
				collection,
				migration,
			} => rewrite_records(txn, collection, migration.as_ref()).await?,
			SchemaOp::ChangeKeyStrategy {
				collection,
				key_path,
				strategy,
				migration,
			} => {
				change_key_strategy(
					txn,
					collection,
					key_path,
					*strategy,
					migration,
					step.version,
				)
				.await?
			}
		}
	}
	Ok(())
}

async fn collection_info(
	txn: &DatabaseTransaction,
	name: &str,
) -> Result<Option<CollectionInfo>, StepError> {
	let mut schema: BTreeMap<String, CollectionInfo> = table::load_schema(txn).await?;
	Ok(schema.remove(name))
}

async fn create_collection(
	txn: &DatabaseTransaction,
	spec: &CollectionSpec,
	version: u32,
) -> Result<(), StepError> {
	if collection_info(txn, &spec.name).await?.is_some() {
		debug!(collection = %spec.name, "Collection already exists, checking indexes");
	} else {
		table::create_collection_table(txn, &spec.name, spec.key_strategy).await?;
		let info = CollectionInfo {
			indexes: Vec::new(),
			..spec.clone().into()
		};
		table::write_collection_meta(txn, &info, version).await?;
		debug!(collection = %spec.name, strategy = %spec.key_strategy, "Created collection");
	}

	for index in &spec.indexes {
		create_index(txn, &spec.name, index).await?;
	}

	Ok(())
}

async fn create_index(
	txn: &DatabaseTransaction,
	collection: &str,
	index: &IndexSpec,
) -> Result<(), StepError> {
	let info = collection_info(txn, collection)
		.await?
		.ok_or_else(|| StepError::UnknownCollection(collection.to_string()))?;

	if info.index(&index.name).is_some() {
		debug!(collection, index = %index.name, "Index already exists");
		return Ok(());
	}

	table::create_index_objects(txn, &info, index).await?;
	debug!(collection, index = %index.name, unique = index.unique, "Created index");
	Ok(())
}

async fn rewrite_records(
	txn: &DatabaseTransaction,
	collection: &str,
	migration: &dyn RecordMigration,
) -> Result<(), StepError> {
	let info = collection_info(txn, collection)
		.await?
		.ok_or_else(|| StepError::UnknownCollection(collection.to_string()))?;

	let mut rewritten = 0usize;
	for record in table::scan(txn, &info).await? {
		let upgraded = migration
			.upgrade(&record)
			.map_err(|reason| StepError::Record {
				collection: collection.to_string(),
				key: record.key.clone(),
				reason,
			})?;

		let Some(upgraded) = upgraded else {
			continue;
		};

		match table::record_key_for(&info, &upgraded)? {
			Some(key) if key == record.key => {}
			_ => {
				return Err(StepError::KeyChanged {
					collection: collection.to_string(),
					key: record.key,
				})
			}
		}

		table::put(txn, &info, upgraded).await?;
		rewritten += 1;
	}

	debug!(collection, rewritten, "Rewrote records");
	Ok(())
}

async fn change_key_strategy(
	txn: &DatabaseTransaction,
	collection: &str,
	key_path: &str,
	strategy: KeyStrategy,
	migration: &Arc<dyn RecordMigration>,
	version: u32,
) -> Result<(), StepError> {
	let info = collection_info(txn, collection)
		.await?
		.ok_or_else(|| StepError::UnknownCollection(collection.to_string()))?;

	let records = table::scan(txn, &info).await?;
	let mut upgraded = Vec::with_capacity(records.len());
	let mut pending = 0usize;

	for record in records {
		match migration.upgrade(&record) {
			Ok(Some(value)) => {
				pending += 1;
				upgraded.push((record.key, value));
			}
			Ok(None) => upgraded.push((record.key, record.value)),
			Err(reason) => {
				return Err(StepError::Record {
					collection: collection.to_string(),
					key: record.key,
					reason,
				})
			}
		}
	}

	if info.key_strategy == strategy && info.key_path == key_path && pending == 0 {
		debug!(collection, "Collection already uses the requested key strategy");
		return Ok(());
	}

	let target = CollectionInfo {
		name: info.name.clone(),
		key_path: key_path.to_string(),
		key_strategy: strategy,
		indexes: info.indexes.clone(),
	};

	// Build the replacement next to the old table, then swap names
	let staging = format!("{collection}__rekey");
	txn.execute_unprepared(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging)))
		.await?;
	table::create_collection_table(txn, &staging, strategy).await?;

	let staging_info = CollectionInfo {
		name: staging.clone(),
		indexes: Vec::new(),
		..target.clone()
	};
	// Two source records landing on one key would silently drop one of them
	let mut placed: BTreeMap<RecordKey, RecordKey> = BTreeMap::new();
	for (source, value) in upgraded {
		if let Some(key) = table::record_key_for(&staging_info, &value)? {
			if let Some(first) = placed.insert(key.clone(), source.clone()) {
				return Err(StepError::KeyCollision {
					collection: collection.to_string(),
					key,
					first,
					second: source,
				});
			}
		}
		table::put(txn, &staging_info, value).await?;
	}

	txn.execute_unprepared(&format!("DROP TABLE {}", quote_ident(collection)))
		.await?;
	txn.execute_unprepared(&format!(
		"ALTER TABLE {} RENAME TO {}",
		quote_ident(&staging),
		quote_ident(collection)
	))
	.await?;

	for index in &info.indexes {
		if index.multi_entry {
			txn.execute_unprepared(&format!(
				"DROP TABLE IF EXISTS {}",
				quote_ident(&side_table_name(collection, &index.name))
			))
			.await?;
		}
		table::create_index_objects(txn, &target, index).await?;
	}

	table::write_collection_meta(txn, &target, version).await?;

	info!(
		collection,
		from = %info.key_strategy,
		to = %strategy,
		rewritten = pending,
		"Rebuilt collection with new key strategy"
	);
	Ok(())
}
