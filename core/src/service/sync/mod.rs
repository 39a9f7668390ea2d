//! Sync Service - background replay of the outbox
//!
//! Runs the sync engine whenever the device comes online:
//! - once at start if already online
//! - on every offline -> online transition
//! - periodically while online, as a safety net
//!
//! A cycle in progress is cancelled when connectivity drops. Entries it left
//! in flight are requeued by the stale sweep of a later cycle.

pub mod backoff;
pub mod connectivity;
pub mod engine;
pub mod policy;
pub mod remote;

use crate::infra::sync::{SyncEvent, SyncReport};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub use backoff::Backoff;
pub use connectivity::{Connectivity, ConnectivitySignal};
pub use engine::{SyncEngine, SyncError};
pub use policy::{FailurePolicy, LoggingPolicy};
pub use remote::{FailureClass, RemoteAuthority, RemoteError, RemoteId, RemoteRequest};

/// Background service driving [`SyncEngine`] from connectivity changes
pub struct SyncService {
	engine: SyncEngine,

	connectivity: Arc<dyn Connectivity>,

	/// Whether the service is running
	is_running: Arc<AtomicBool>,

	/// Shutdown signal
	shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl SyncService {
	/// Service driving `engine` from connectivity changes and the safety timer
	pub fn new(engine: SyncEngine, connectivity: Arc<dyn Connectivity>) -> Self {
		Self {
			engine,
			connectivity,
			is_running: Arc::new(AtomicBool::new(false)),
			shutdown_tx: Arc::new(Mutex::new(None)),
		}
	}

	/// Engine used for cycles
	pub fn engine(&self) -> &SyncEngine {
		&self.engine
	}

	/// Main sync loop (spawned as background task)
	async fn run_sync_loop(
		engine: SyncEngine,
		connectivity: Arc<dyn Connectivity>,
		is_running: Arc<AtomicBool>,
		mut shutdown_rx: broadcast::Receiver<()>,
	) {
		info!("Starting sync loop");

		let mut online_rx = connectivity.subscribe();
		let mut safety = tokio::time::interval(engine.config().safety_interval());
		safety.set_missed_tick_behavior(MissedTickBehavior::Delay);

		tokio::select! {
			_ = async {
				// The first tick completes immediately
				safety.tick().await;
				let mut run_now = *online_rx.borrow_and_update();

				loop {
					if run_now {
						Self::run_cycle(&engine, &online_rx).await;
						safety.reset();
					}

					run_now = tokio::select! {
						changed = online_rx.changed() => match changed {
							Ok(()) => *online_rx.borrow_and_update(),
							Err(_) => {
								warn!("Connectivity signal dropped");
								break;
							}
						},
						_ = safety.tick() => {
							let online = *online_rx.borrow();
							if online {
								debug!("Safety interval elapsed");
							}
							online
						}
					};
				}
			} => {
				info!("Sync loop ended");
			}
			_ = shutdown_rx.recv() => {
				info!("Sync loop shutdown signal received");
			}
		}

		is_running.store(false, Ordering::SeqCst);
		info!("Sync loop stopped");
	}

	/// Runs one cycle, abandoning it if connectivity drops meanwhile
	async fn run_cycle(engine: &SyncEngine, online_rx: &watch::Receiver<bool>) {
		let mut offline_rx = online_rx.clone();

		tokio::select! {
			result = engine.run_sync_cycle() => {
				if let Err(e) = result {
					error!(error = %e, "Sync cycle failed");
				}
			}
			_ = offline_rx.wait_for(|online| !*online) => {
				warn!("Connectivity lost, sync cycle cancelled");
				engine.events().emit(SyncEvent::CycleCompleted {
					report: SyncReport::default(),
					cancelled: true,
				});
			}
		}
	}
}

#[async_trait]
impl crate::service::Service for SyncService {
	fn name(&self) -> &'static str {
		"sync_service"
	}

	fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	async fn start(&self) -> Result<()> {
		if self.is_running.load(Ordering::SeqCst) {
			warn!("Sync service already running");
			return Ok(());
		}

		info!("Starting sync service");

		let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
		*self.shutdown_tx.lock().await = Some(shutdown_tx);

		self.is_running.store(true, Ordering::SeqCst);

		let engine = self.engine.clone();
		let connectivity = self.connectivity.clone();
		let is_running = self.is_running.clone();
		tokio::spawn(async move {
			Self::run_sync_loop(engine, connectivity, is_running, shutdown_rx).await;
		});

		Ok(())
	}

	async fn stop(&self) -> Result<()> {
		if !self.is_running.load(Ordering::SeqCst) {
			return Ok(());
		}

		info!("Stopping sync service");

		if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
			let _ = shutdown_tx.send(());
		}

		self.is_running.store(false, Ordering::SeqCst);

		info!("Sync service stopped");

		Ok(())
	}
}
