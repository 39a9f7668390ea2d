//! Store handle manager
//!
//! Opens stores, runs the migration engine when the on-disk version is behind
//! the requested one, and hands out [`StoreHandle`]s through which every read
//! and write happens inside an [`AtomicScope`].
//!
//! Handles are explicit values owned by the caller. A handle holding a store
//! open at a lower version blocks upgrades: the manager asks it to close via
//! [`StoreHandle::version_changes`] and gives up with [`OpenError::Blocked`]
//! if it does not close in time.

use super::{
	catalog::SchemaCatalog,
	event::{StoreEvent, StoreEventBus, VersionChangeRequest},
	migrator::{read_version, MigrationEngine, MigrationError},
	schema::{validate_name, CollectionInfo, SchemaError, COLLECTIONS_TABLE},
	scope::{AtomicScope, TxError, TxMode},
	table,
};
use crate::config::StoreConfig;
use parking_lot::Mutex;
use sea_orm::{
	ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, TransactionTrait,
};
use std::{
	collections::{BTreeMap, HashMap},
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Weak,
	},
	time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OpenError {
	#[error("store {name} is blocked: {holders} open handle(s) below version {target}")]
	Blocked {
		name: String,
		holders: usize,
		target: u32,
	},

	#[error("store {name} is at version {on_disk}, newer than the requested {requested}")]
	VersionTooNew {
		name: String,
		on_disk: u32,
		requested: u32,
	},

	#[error("version {requested} is not declared by the schema catalog (latest is {latest})")]
	UnknownVersion { requested: u32, latest: u32 },

	#[error(transparent)]
	Migration(#[from] MigrationError),

	#[error("invalid store name: {0}")]
	InvalidName(#[from] SchemaError),

	#[error("store unavailable: {0}")]
	Unavailable(#[from] DbErr),

	#[error("failed to prepare data directory: {0}")]
	Io(#[from] std::io::Error),
}

impl OpenError {
	/// Whether retrying the open later can succeed without any other change
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Blocked { .. })
	}
}

/// Registry entry for one live handle
#[derive(Debug)]
struct Slot {
	id: u64,
	version: u32,
	closed: AtomicBool,
	version_change: broadcast::Sender<VersionChangeRequest>,
}

struct ManagerInner {
	config: StoreConfig,
	catalog: Arc<SchemaCatalog>,
	events: StoreEventBus,
	slots: Mutex<HashMap<String, Vec<Arc<Slot>>>>,
	upgrade_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
	// Bumped whenever a handle is released so blocked opens can re-check
	releases: watch::Sender<u64>,
	next_slot: AtomicU64,
}

impl ManagerInner {
	fn release(&self, name: &str, slot: &Slot) {
		let mut slots = self.slots.lock();
		if let Some(open) = slots.get_mut(name) {
			open.retain(|other| other.id != slot.id);
			if open.is_empty() {
				slots.remove(name);
			}
		}
		drop(slots);

		self.releases.send_modify(|n| *n = n.wrapping_add(1));
	}

	fn lower_holders(&self, name: &str, target: u32) -> Vec<Arc<Slot>> {
		self.slots
			.lock()
			.get(name)
			.map(|open| {
				open.iter()
					.filter(|slot| slot.version < target && !slot.closed.load(Ordering::Acquire))
					.cloned()
					.collect()
			})
			.unwrap_or_default()
	}
}

/// Opens stores and tracks the handles that are live in this process
#[derive(Clone)]
pub struct StoreManager {
	inner: Arc<ManagerInner>,
}

impl StoreManager {
	/// Manager opening stores under the configured directory
	pub fn new(config: StoreConfig, catalog: Arc<SchemaCatalog>) -> Self {
		let (releases, _) = watch::channel(0);
		Self {
			inner: Arc::new(ManagerInner {
				config,
				catalog,
				events: StoreEventBus::default(),
				slots: Mutex::new(HashMap::new()),
				upgrade_locks: Mutex::new(HashMap::new()),
				releases,
				next_slot: AtomicU64::new(1),
			}),
		}
	}

	/// Catalog stores are upgraded with
	pub fn catalog(&self) -> &Arc<SchemaCatalog> {
		&self.inner.catalog
	}

	/// Bus carrying open, upgrade and close events
	pub fn events(&self) -> &StoreEventBus {
		&self.inner.events
	}

	/// Number of live handles on a store in this process
	pub fn open_handles(&self, name: &str) -> usize {
		self.inner
			.slots
			.lock()
			.get(name)
			.map(Vec::len)
			.unwrap_or(0)
	}

	/// Database file backing the store called `name`
	pub fn store_path(&self, name: &str) -> PathBuf {
		self.inner.config.data_dir.join(format!("{name}.db"))
	}

	fn upgrade_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
		self.inner
			.upgrade_locks
			.lock()
			.entry(name.to_string())
			.or_default()
			.clone()
	}

	/// Opens `name` at `target`, upgrading the store first when it is behind
	pub async fn open(&self, name: &str, target: u32) -> Result<StoreHandle, OpenError> {
		validate_name(name)?;

		let catalog = &self.inner.catalog;
		if !catalog.declares(target) {
			return Err(OpenError::UnknownVersion {
				requested: target,
				latest: catalog.current_version(),
			});
		}

		// One open per store name at a time so an upgrade runs exactly once
		let lock = self.upgrade_lock(name);
		let _guard = lock.lock().await;

		let db = self.connect(name).await?;
		let observed = read_version(&db).await?;

		if observed > target {
			return Err(OpenError::VersionTooNew {
				name: name.to_string(),
				on_disk: observed,
				requested: target,
			});
		}

		if observed < target {
			self.inner.events.emit(StoreEvent::UpgradeNeeded {
				store: name.to_string(),
				old_version: observed,
				new_version: target,
			});
			info!(store = %name, from = observed, to = target, "Store upgrade needed");

			self.wait_for_lower_holders(name, target).await?;

			let from = MigrationEngine::new(catalog).upgrade(&db, target).await?;
			if from < target {
				self.inner.events.emit(StoreEvent::Upgraded {
					store: name.to_string(),
					old_version: from,
					new_version: target,
				});
				info!(store = %name, from, to = target, "Store upgraded");
			}
		}

		// Another process may have moved the store on while we were waiting
		let on_disk = read_version(&db).await?;
		if on_disk != target {
			return Err(OpenError::VersionTooNew {
				name: name.to_string(),
				on_disk,
				requested: target,
			});
		}

		table::ensure_meta_tables(&db).await?;
		let collections = table::load_schema(&db)
			.await?
			.into_iter()
			.map(|(name, info)| (name, Arc::new(info)))
			.collect();

		let (version_change, _) = broadcast::channel(4);
		let slot = Arc::new(Slot {
			id: self.inner.next_slot.fetch_add(1, Ordering::Relaxed),
			version: target,
			closed: AtomicBool::new(false),
			version_change,
		});

		self.inner
			.slots
			.lock()
			.entry(name.to_string())
			.or_default()
			.push(slot.clone());

		debug!(store = %name, version = target, slot = slot.id, "Store handle opened");

		Ok(StoreHandle {
			inner: Arc::new(HandleInner {
				name: name.to_string(),
				version: target,
				db,
				collections,
				write_gate: Arc::new(tokio::sync::Mutex::new(())),
				slot,
				manager: Arc::downgrade(&self.inner),
			}),
		})
	}

	async fn connect(&self, name: &str) -> Result<DatabaseConnection, OpenError> {
		let config = &self.inner.config;
		tokio::fs::create_dir_all(&config.data_dir).await?;

		let path = self.store_path(name);
		let mut opt = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
		opt.max_connections(config.max_connections.max(1))
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.sqlx_logging(false);

		let db = Database::connect(opt).await?;
		db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
		db.execute_unprepared("PRAGMA foreign_keys = ON").await?;

		Ok(db)
	}

	/// Asks lower-version handles to close, then waits for them to do so
	async fn wait_for_lower_holders(&self, name: &str, target: u32) -> Result<(), OpenError> {
		let wait = Duration::from_millis(self.inner.config.blocked_timeout_ms);
		let deadline = tokio::time::Instant::now() + wait;
		let mut releases = self.inner.releases.subscribe();
		let mut notified = false;

		loop {
			let holders = self.inner.lower_holders(name, target);
			if holders.is_empty() {
				return Ok(());
			}

			if !notified {
				notified = true;
				for slot in &holders {
					let _ = slot.version_change.send(VersionChangeRequest {
						old_version: slot.version,
						new_version: target,
					});
					self.inner.events.emit(StoreEvent::VersionChange {
						store: name.to_string(),
						old_version: slot.version,
						new_version: target,
					});
				}
				self.inner.events.emit(StoreEvent::Blocked {
					store: name.to_string(),
					holders: holders.len(),
					requested_version: target,
				});
				warn!(
					store = %name,
					holders = holders.len(),
					target,
					"Store upgrade blocked by open handles, waiting for them to close"
				);
			}

			match tokio::time::timeout_at(deadline, releases.changed()).await {
				Ok(Ok(())) => continue,
				Ok(Err(_)) | Err(_) => {
					return Err(OpenError::Blocked {
						name: name.to_string(),
						holders: holders.len(),
						target,
					})
				}
			}
		}
	}
}

struct HandleInner {
	name: String,
	version: u32,
	db: DatabaseConnection,
	collections: BTreeMap<String, Arc<CollectionInfo>>,
	write_gate: Arc<tokio::sync::Mutex<()>>,
	slot: Arc<Slot>,
	manager: Weak<ManagerInner>,
}

impl HandleInner {
	fn close(&self) -> bool {
		if self.slot.closed.swap(true, Ordering::AcqRel) {
			return false;
		}
		if let Some(manager) = self.manager.upgrade() {
			manager.release(&self.name, &self.slot);
			manager.events.emit(StoreEvent::Closed {
				store: self.name.clone(),
				version: self.version,
			});
		}
		true
	}
}

impl Drop for HandleInner {
	fn drop(&mut self) {
		self.close();
	}
}

/// A live connection to a store at a fixed schema version
///
/// Cloning is cheap; all clones share the same connection and close together.
#[derive(Clone)]
pub struct StoreHandle {
	inner: Arc<HandleInner>,
}

impl StoreHandle {
	/// Name the store was opened under
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Version the store was opened at
	pub fn version(&self) -> u32 {
		self.inner.version
	}

	/// Whether [`StoreHandle::close`] ran or a newer version asked this handle to close
	pub fn is_closed(&self) -> bool {
		self.inner.slot.closed.load(Ordering::Acquire)
	}

	/// Whether the schema has a collection called `name`
	pub fn has_collection(&self, name: &str) -> bool {
		self.inner.collections.contains_key(name)
	}

	/// Schema of a collection
	pub fn collection(&self, name: &str) -> Option<&CollectionInfo> {
		self.inner.collections.get(name).map(Arc::as_ref)
	}

	/// Names of every collection in the schema
	pub fn collection_names(&self) -> impl Iterator<Item = &str> {
		self.inner.collections.keys().map(String::as_str)
	}

	/// Requests sent when another open wants to upgrade past this handle
	pub fn version_changes(&self) -> broadcast::Receiver<VersionChangeRequest> {
		self.inner.slot.version_change.subscribe()
	}

	/// Version currently stamped on disk
	pub async fn on_disk_version(&self) -> Result<u32, TxError> {
		if self.is_closed() {
			return Err(TxError::Closed);
		}
		Ok(read_version(&self.inner.db).await?)
	}

	/// Opens an atomic scope over `collections`
	///
	/// Fails fast with [`TxError::MissingCollections`] when any of them is not
	/// part of the store's schema.
	pub async fn transaction(
		&self,
		collections: &[&str],
		mode: TxMode,
	) -> Result<AtomicScope, TxError> {
		if self.is_closed() {
			return Err(TxError::Closed);
		}

		let mut missing = Vec::new();
		let mut scoped = BTreeMap::new();
		for name in collections {
			match self.inner.collections.get(*name) {
				Some(info) => {
					scoped.insert(name.to_string(), info.clone());
				}
				None => missing.push(name.to_string()),
			}
		}
		if !missing.is_empty() {
			return Err(TxError::MissingCollections(missing));
		}

		let gate = match mode {
			TxMode::ReadWrite => Some(self.inner.write_gate.clone().lock_owned().await),
			TxMode::ReadOnly => None,
		};

		let txn = self.inner.db.begin().await?;
		if mode == TxMode::ReadWrite {
			// Take the write lock before any read so the scope never has to
			// upgrade a stale read snapshot
			txn.execute_unprepared(&format!("UPDATE {COLLECTIONS_TABLE} SET name = name WHERE 0"))
				.await?;
		}

		Ok(AtomicScope::new(txn, mode, scoped, self.inner.name.clone(), gate))
	}

	/// Releases the handle. Scopes already open finish normally; new ones fail
	/// with [`TxError::Closed`].
	pub fn close(&self) {
		if self.inner.close() {
			debug!(store = %self.inner.name, version = self.inner.version, "Store handle closed");
		}
	}
}

impl std::fmt::Debug for StoreHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StoreHandle")
			.field("name", &self.inner.name)
			.field("version", &self.inner.version)
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::{
		catalog::{MigrationStep, SchemaOp},
		record::RecordKey,
		schema::{CollectionSpec, IndexSpec},
	};
	use serde_json::json;
	use tempfile::TempDir;

	fn catalog() -> Arc<SchemaCatalog> {
		Arc::new(
			SchemaCatalog::new(vec![
				MigrationStep::new(1, "notes", "").op(SchemaOp::CreateCollection(
					CollectionSpec::supplied("notes", "id"),
				)),
				MigrationStep::new(2, "drafts", "").op(SchemaOp::CreateCollection(
					CollectionSpec::sequential("drafts", "id").index(IndexSpec::on_field("title")),
				)),
			])
			.unwrap(),
		)
	}

	fn manager(temp: &TempDir, blocked_timeout_ms: u64) -> StoreManager {
		StoreManager::new(
			StoreConfig {
				data_dir: temp.path().to_path_buf(),
				max_connections: 2,
				blocked_timeout_ms,
			},
			catalog(),
		)
	}

	#[tokio::test]
	async fn test_open_creates_and_upgrades() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 100);
		let mut events = manager.events().subscribe();

		let v1 = manager.open("app", 1).await.unwrap();
		assert!(v1.has_collection("notes"));
		assert!(!v1.has_collection("drafts"));
		v1.close();

		let v2 = manager.open("app", 2).await.unwrap();
		assert!(v2.has_collection("drafts"));
		assert_eq!(v2.on_disk_version().await.unwrap(), 2);

		let mut upgrades = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let StoreEvent::Upgraded {
				old_version,
				new_version,
				..
			} = event
			{
				upgrades.push((old_version, new_version));
			}
		}
		assert_eq!(upgrades, vec![(0, 1), (1, 2)]);
	}

	#[tokio::test]
	async fn test_missing_collections_fail_fast() {
		let temp = TempDir::new().unwrap();
		let handle = manager(&temp, 100).open("app", 1).await.unwrap();

		match handle
			.transaction(&["notes", "drafts", "ghosts"], TxMode::ReadOnly)
			.await
		{
			Err(TxError::MissingCollections(missing)) => {
				assert_eq!(missing, vec!["drafts".to_string(), "ghosts".to_string()])
			}
			other => panic!("unexpected result: {:?}", other.map(|_| ())),
		}
	}

	#[tokio::test]
	async fn test_scope_commit_and_abort() {
		let temp = TempDir::new().unwrap();
		let handle = manager(&temp, 100).open("app", 2).await.unwrap();

		let scope = handle
			.transaction(&["notes", "drafts"], TxMode::ReadWrite)
			.await
			.unwrap();
		scope.put("notes", json!({"id": "n1"})).await.unwrap();
		let key = scope.put("drafts", json!({"title": "first"})).await.unwrap();
		scope.commit().await.unwrap();
		assert_eq!(key, RecordKey::Int(1));

		let scope = handle
			.transaction(&["notes"], TxMode::ReadWrite)
			.await
			.unwrap();
		scope.put("notes", json!({"id": "n2"})).await.unwrap();
		scope.abort().await.unwrap();

		let scope = handle
			.transaction(&["notes", "drafts"], TxMode::ReadOnly)
			.await
			.unwrap();
		assert_eq!(scope.count("notes").await.unwrap(), 1);
		let draft = scope.get("drafts", &RecordKey::Int(1)).await.unwrap().unwrap();
		assert_eq!(draft.value, json!({"id": 1, "title": "first"}));
		assert!(matches!(
			scope.put("notes", json!({"id": "n3"})).await,
			Err(TxError::ReadOnly { .. })
		));
		assert!(matches!(
			scope.get("drafts_missing", &RecordKey::Int(1)).await,
			Err(TxError::NotInScope { .. })
		));
	}

	#[tokio::test]
	async fn test_version_too_new_is_reported() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 100);
		manager.open("app", 2).await.unwrap().close();

		let err = manager.open("app", 1).await.unwrap_err();
		assert!(matches!(
			err,
			OpenError::VersionTooNew {
				on_disk: 2,
				requested: 1,
				..
			}
		));
		assert!(!err.is_retryable());
	}

	#[tokio::test]
	async fn test_undeclared_version_rejected() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 100);
		assert!(matches!(
			manager.open("app", 3).await,
			Err(OpenError::UnknownVersion {
				requested: 3,
				latest: 2
			})
		));
		assert!(matches!(
			manager.open("bad name", 1).await,
			Err(OpenError::InvalidName(_))
		));
	}

	#[tokio::test]
	async fn test_blocked_open_is_retryable() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 50);
		let v1 = manager.open("app", 1).await.unwrap();
		let mut changes = v1.version_changes();

		let err = manager.open("app", 2).await.unwrap_err();
		assert!(err.is_retryable());
		assert!(matches!(err, OpenError::Blocked { holders: 1, target: 2, .. }));
		assert_eq!(
			changes.try_recv().unwrap(),
			VersionChangeRequest {
				old_version: 1,
				new_version: 2
			}
		);

		// The old handle still works and the store was left alone
		assert_eq!(v1.on_disk_version().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_handle_closing_on_request_unblocks_upgrade() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 5_000);
		let v1 = manager.open("app", 1).await.unwrap();
		let mut changes = v1.version_changes();

		let closer = tokio::spawn(async move {
			changes.recv().await.unwrap();
			v1.close();
			v1
		});

		let v2 = manager.open("app", 2).await.unwrap();
		let v1 = closer.await.unwrap();

		assert_eq!(v2.version(), 2);
		assert!(matches!(
			v1.transaction(&["notes"], TxMode::ReadOnly).await,
			Err(TxError::Closed)
		));
		assert_eq!(manager.open_handles("app"), 1);
	}

	#[tokio::test]
	async fn test_dropped_handle_releases_slot() {
		let temp = TempDir::new().unwrap();
		let manager = manager(&temp, 50);

		let handle = manager.open("app", 1).await.unwrap();
		let clone = handle.clone();
		drop(handle);
		assert_eq!(manager.open_handles("app"), 1);
		drop(clone);
		assert_eq!(manager.open_handles("app"), 0);

		manager.open("app", 2).await.unwrap();
	}
}
