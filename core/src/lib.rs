//! Offline-first client data layer
//!
//! A versioned local store with a migration engine, plus a durable outbox
//! that replays local writes against a remote authority once the device is
//! online again.

pub mod config;
pub mod infra;
pub mod service;

use config::CoreConfig;
use infra::{
	db::{migration, StoreHandle, StoreManager},
	sync::{SyncQueue, SystemTimeSource, TimeSource},
};
use service::{
	sync::{Connectivity, FailurePolicy, RemoteAuthority, SyncEngine, SyncService},
	Service,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the application store inside the store directory
pub const STORE_NAME: &str = "tether";

/// Installs the global tracing subscriber
///
/// `RUST_LOG` overrides `level`. With a log directory, output is also written
/// to a daily-rotating file; keep the returned guard alive to flush it.
/// Calling this again once a subscriber is installed is a no-op.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
	let env_filter = format!("warn,tether_core={level}");

	let (file_layer, guard) = match log_dir {
		Some(dir) => {
			std::fs::create_dir_all(dir)?;
			let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "tether.log");
			let (writer, guard) = tracing_appender::non_blocking(file_appender);
			let layer = fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_ansi(false)
				.with_writer(writer);
			(Some(layer), Some(guard))
		}
		None => (None, None),
	};

	let _ = tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter)))
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_writer(std::io::stdout),
		)
		.with(file_layer)
		.try_init();

	Ok(guard)
}

/// The data layer wired together: store, outbox, sync engine and service
pub struct Core {
	config: CoreConfig,

	pub stores: StoreManager,

	pub store: StoreHandle,

	pub queue: SyncQueue,

	sync: SyncService,

	// Flushes the log file on drop
	_log_guard: Option<WorkerGuard>,
}

impl Core {
	/// Loads `tether.json` from `data_dir`, installs logging and opens the
	/// application store
	pub async fn new(
		data_dir: impl Into<PathBuf>,
		remote: Arc<dyn RemoteAuthority>,
		policy: Arc<dyn FailurePolicy>,
		connectivity: Arc<dyn Connectivity>,
	) -> anyhow::Result<Self> {
		let config = CoreConfig::load_from(&data_dir.into())?;
		let log_guard = init_logging(&config.log_level, Some(config.logs_dir().as_path()))?;

		let mut core =
			Self::with_config(config, remote, policy, connectivity, Arc::new(SystemTimeSource))
				.await?;
		core._log_guard = log_guard;
		Ok(core)
	}

	/// Builds the core from an already loaded configuration
	///
	/// Leaves logging to the caller.
	pub async fn with_config(
		config: CoreConfig,
		remote: Arc<dyn RemoteAuthority>,
		policy: Arc<dyn FailurePolicy>,
		connectivity: Arc<dyn Connectivity>,
		time: Arc<dyn TimeSource>,
	) -> anyhow::Result<Self> {
		info!("Initializing core at {:?}", config.data_dir);
		config.validate()?;

		let catalog = Arc::new(migration::standard_catalog()?);
		let stores = StoreManager::new(config.store.clone(), catalog);
		let store = stores.open(STORE_NAME, migration::CURRENT_VERSION).await?;

		let queue = SyncQueue::new(store.clone(), time)?;
		let engine = SyncEngine::new(queue.clone(), remote, policy, config.sync.clone());
		let sync = SyncService::new(engine, connectivity);

		info!(version = store.version(), "Core initialized");

		Ok(Self {
			config,
			stores,
			store,
			queue,
			sync,
			_log_guard: None,
		})
	}

	/// Configuration the core was built from
	pub fn config(&self) -> &CoreConfig {
		&self.config
	}

	/// Engine behind the background service, for manual cycles
	pub fn engine(&self) -> &SyncEngine {
		self.sync.engine()
	}

	/// Background sync service
	pub fn sync_service(&self) -> &SyncService {
		&self.sync
	}

	/// Starts background sync
	pub async fn start(&self) -> anyhow::Result<()> {
		self.sync.start().await
	}

	/// Stops background sync and closes the store handle
	pub async fn shutdown(&self) -> anyhow::Result<()> {
		info!("Shutting down core");
		self.sync.stop().await?;
		self.store.close();
		info!("Core shutdown complete");
		Ok(())
	}
}
