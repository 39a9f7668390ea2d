//! Store and engine setup over a temporary directory

use super::{MockRemote, RecordingPolicy};
use std::sync::Arc;
use tempfile::TempDir;
use tether_core::{
	config::{StoreConfig, SyncConfig},
	infra::{
		db::{migration, SchemaCatalog, StoreHandle, StoreManager},
		sync::{FakeTimeSource, SyncQueue, TimeSource},
	},
	service::sync::SyncEngine,
};

/// Deterministic engine settings: no jitter, short delays, no pruning
pub fn sync_config() -> SyncConfig {
	SyncConfig {
		max_retries: 3,
		base_delay_ms: 100,
		max_delay_ms: 1_000,
		in_flight_timeout_ms: 5_000,
		request_timeout_ms: 2_000,
		batch_size: 10,
		workers: 4,
		jitter_ratio: 0.0,
		succeeded_retention_ms: None,
		..SyncConfig::default()
	}
}

pub fn store_config(temp: &TempDir) -> StoreConfig {
	StoreConfig {
		data_dir: temp.path().to_path_buf(),
		max_connections: 4,
		blocked_timeout_ms: 200,
	}
}

pub fn manager(temp: &TempDir, catalog: SchemaCatalog) -> StoreManager {
	StoreManager::new(store_config(temp), Arc::new(catalog))
}

pub fn standard_manager(temp: &TempDir) -> StoreManager {
	manager(temp, migration::standard_catalog().unwrap())
}

/// Application store at the current version with an outbox over a fake clock
pub struct TestStore {
	pub manager: StoreManager,
	pub handle: StoreHandle,
	pub queue: SyncQueue,
	pub time: FakeTimeSource,
	_temp: TempDir,
}

impl TestStore {
	pub async fn open() -> Self {
		let temp = TempDir::new().unwrap();
		let manager = standard_manager(&temp);
		let handle = manager
			.open("tether", migration::CURRENT_VERSION)
			.await
			.unwrap();
		let time = FakeTimeSource::new(1_000_000);
		let queue = SyncQueue::new(handle.clone(), Arc::new(time.clone())).unwrap();

		Self {
			manager,
			handle,
			queue,
			time,
			_temp: temp,
		}
	}

	pub fn time_now(&self) -> i64 {
		self.time.now_ms()
	}

	pub fn engine(&self, remote: &Arc<MockRemote>, policy: &Arc<RecordingPolicy>) -> SyncEngine {
		self.engine_with(remote, policy, sync_config())
	}

	pub fn engine_with(
		&self,
		remote: &Arc<MockRemote>,
		policy: &Arc<RecordingPolicy>,
		config: SyncConfig,
	) -> SyncEngine {
		SyncEngine::new(self.queue.clone(), remote.clone(), policy.clone(), config)
	}
}
