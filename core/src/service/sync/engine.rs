//! Sync engine: replays outbox entries against the remote authority
//!
//! A cycle first requeues in-flight entries left behind by a crashed or
//! cancelled cycle, then drains due pending entries batch by batch. Entries
//! for different records are replayed concurrently up to the worker limit;
//! the outbox only ever hands out the earliest open entry per record, and
//! the in-flight claim is re-checked inside its own scope, so one record
//! never has two changes in flight. Claims held by running requests are
//! tracked per engine and never swept as stale, and an outcome is only
//! written back under the claim it was sent with.

use super::{
	backoff::Backoff,
	policy::FailurePolicy,
	remote::{FailureClass, RemoteAuthority, RemoteError, RemoteRequest},
};
use crate::config::SyncConfig;
use crate::infra::sync::{OutboxEntry, OutboxError, SyncEvent, SyncEventBus, SyncQueue, SyncReport};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Outbox(#[from] OutboxError),

	/// The entry left `in_flight` under this attempt's claim while its request
	/// was running, usually because a recovery sweep requeued it.
	#[error("outbox entry {id} is no longer in flight")]
	StaleInFlight { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
	Succeeded,
	Retried,
	Failed,
	Abandoned,
	Skipped,
	Stale,
}

fn record(report: &mut SyncReport, outcome: Outcome) {
	match outcome {
		Outcome::Succeeded => report.succeeded += 1,
		Outcome::Retried => report.retried += 1,
		Outcome::Failed => report.failed += 1,
		Outcome::Abandoned => report.abandoned += 1,
		Outcome::Skipped => report.skipped += 1,
		Outcome::Stale => report.stale += 1,
	}
}

/// Keeps a claim token registered while its request runs
///
/// Dropped with the replay future, so a cancelled cycle releases its claims
/// to the next stale sweep.
struct LiveClaim {
	claims: Arc<Mutex<HashSet<String>>>,
	token: String,
}

impl LiveClaim {
	fn register(claims: &Arc<Mutex<HashSet<String>>>) -> Self {
		let token = OutboxEntry::generate_claim();
		claims.lock().insert(token.clone());
		Self {
			claims: claims.clone(),
			token,
		}
	}
}

impl Drop for LiveClaim {
	fn drop(&mut self) {
		self.claims.lock().remove(&self.token);
	}
}

/// Claim failures that mean another cycle got there first
fn is_lost_claim(error: &OutboxError) -> bool {
	matches!(
		error,
		OutboxError::InvalidTransition { .. }
			| OutboxError::NotFound(_)
			| OutboxError::NotDue { .. }
			| OutboxError::RecordBusy { .. }
	)
}

#[derive(Clone)]
pub struct SyncEngine {
	queue: SyncQueue,
	remote: Arc<dyn RemoteAuthority>,
	policy: Arc<dyn FailurePolicy>,
	config: Arc<SyncConfig>,
	backoff: Backoff,
	events: SyncEventBus,
	/// Claim tokens of requests currently running on this engine
	live_claims: Arc<Mutex<HashSet<String>>>,
}

impl SyncEngine {
	/// Engine with its own event bus
	pub fn new(
		queue: SyncQueue,
		remote: Arc<dyn RemoteAuthority>,
		policy: Arc<dyn FailurePolicy>,
		config: SyncConfig,
	) -> Self {
		Self::with_events(queue, remote, policy, config, SyncEventBus::new())
	}

	/// Engine publishing to a shared event bus
	pub fn with_events(
		queue: SyncQueue,
		remote: Arc<dyn RemoteAuthority>,
		policy: Arc<dyn FailurePolicy>,
		config: SyncConfig,
		events: SyncEventBus,
	) -> Self {
		Self {
			backoff: Backoff::from_config(&config),
			config: Arc::new(config),
			queue,
			remote,
			policy,
			events,
			live_claims: Arc::new(Mutex::new(HashSet::new())),
		}
	}

	/// Outbox the engine replays
	pub fn queue(&self) -> &SyncQueue {
		&self.queue
	}

	/// Sync settings the engine runs with
	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	/// Bus carrying cycle and entry events
	pub fn events(&self) -> &SyncEventBus {
		&self.events
	}

	/// Runs one full cycle: stale sweep, replay of every due entry, pruning
	pub async fn run_sync_cycle(&self) -> Result<SyncReport, SyncError> {
		let mut report = SyncReport::default();

		let cutoff = self
			.queue
			.now_ms()
			.saturating_sub(self.config.in_flight_timeout_ms as i64);
		let live = self.live_claims.lock().clone();
		let recovered = self.queue.recover_stale(cutoff, &live).await?;
		if !recovered.is_empty() {
			let ids: Vec<String> = recovered.into_iter().map(|entry| entry.id).collect();
			warn!(count = ids.len(), ids = ?ids, "Recovered stale in-flight entries");
			report.recovered = ids.len();
			self.events.emit(SyncEvent::StaleRecovered { ids });
		}

		// An entry is replayed at most once per cycle, even if a zero backoff
		// makes it due again immediately
		let mut seen = HashSet::new();
		let batch_size = self.config.batch_size.max(1);
		loop {
			let batch: Vec<OutboxEntry> = self
				.queue
				.next_batch(batch_size + seen.len())
				.await?
				.into_iter()
				.filter(|entry| !seen.contains(&entry.id))
				.take(batch_size)
				.collect();
			if batch.is_empty() {
				break;
			}
			seen.extend(batch.iter().map(|entry| entry.id.clone()));

			debug!(entries = batch.len(), "Replaying outbox batch");
			let outcomes: Vec<Result<Outcome, SyncError>> = stream::iter(batch)
				.map(|entry| self.replay(entry))
				.buffer_unordered(self.config.workers.max(1))
				.collect()
				.await;

			for outcome in outcomes {
				record(&mut report, outcome?);
			}
		}

		if let Some(retention) = self.config.succeeded_retention_ms {
			let before = self.queue.now_ms().saturating_sub(retention as i64);
			self.queue.prune(before).await?;
		}

		if !report.is_empty() {
			info!(
				succeeded = report.succeeded,
				retried = report.retried,
				failed = report.failed,
				abandoned = report.abandoned,
				recovered = report.recovered,
				skipped = report.skipped,
				stale = report.stale,
				"Sync cycle completed"
			);
		}
		self.events.emit(SyncEvent::CycleCompleted {
			report: report.clone(),
			cancelled: false,
		});

		Ok(report)
	}

	async fn replay(&self, entry: OutboxEntry) -> Result<Outcome, SyncError> {
		let claim = LiveClaim::register(&self.live_claims);
		let entry = match self
			.queue
			.mark_in_flight_with(&entry.id, claim.token.clone())
			.await
		{
			Ok(entry) => entry,
			Err(e) if is_lost_claim(&e) => {
				debug!(entry_id = %entry.id, reason = %e, "Skipping outbox entry");
				return Ok(Outcome::Skipped);
			}
			Err(e) => return Err(e.into()),
		};

		let result = self.submit(&entry).await;

		let outcome = match self.finish(&entry, result).await {
			Err(SyncError::StaleInFlight { id }) => {
				warn!(entry_id = %id, "Outcome dropped, entry no longer held by this attempt");
				Ok(Outcome::Stale)
			}
			other => other,
		};
		drop(claim);
		outcome
	}

	async fn submit(&self, entry: &OutboxEntry) -> Result<String, RemoteError> {
		let request = RemoteRequest::from_entry(entry);
		let timeout = self.config.request_timeout();
		match tokio::time::timeout(timeout, self.remote.submit(&request)).await {
			Ok(result) => result,
			Err(_) => Err(RemoteError::Timeout {
				after_ms: self.config.request_timeout_ms,
			}),
		}
	}

	/// Records the outcome of one attempt
	async fn finish(
		&self,
		entry: &OutboxEntry,
		result: Result<String, RemoteError>,
	) -> Result<Outcome, SyncError> {
		let stale = |e: OutboxError| match e {
			OutboxError::InvalidTransition { .. }
			| OutboxError::NotFound(_)
			| OutboxError::ClaimLost { .. } => {
				SyncError::StaleInFlight {
					id: entry.id.clone(),
				}
			}
			other => other.into(),
		};

		let error = match result {
			Ok(remote_id) => {
				self.queue
					.mark_succeeded(entry, Some(remote_id))
					.await
					.map_err(stale)?;
				return Ok(Outcome::Succeeded);
			}
			Err(error) => error,
		};
		let message = error.to_string();

		match error.class() {
			FailureClass::Permanent => {
				let failed = self
					.queue
					.mark_failed(entry, &message)
					.await
					.map_err(stale)?;
				error!(
					entry_id = %failed.id,
					collection = %failed.collection,
					error = %message,
					"Outbox entry failed permanently"
				);
				self.policy.on_permanent_failure(&failed, &error).await;
				self.events.emit(SyncEvent::EntryFailed {
					entry: failed,
					error: message,
				});
				Ok(Outcome::Failed)
			}
			FailureClass::Transient
				if entry.retry_count.saturating_add(1) >= self.config.max_retries =>
			{
				let abandoned = self
					.queue
					.abandon(entry, &message)
					.await
					.map_err(stale)?;
				error!(
					entry_id = %abandoned.id,
					retries = abandoned.retry_count,
					error = %message,
					"Outbox entry abandoned"
				);
				self.policy.on_abandoned(&abandoned).await;
				self.events.emit(SyncEvent::EntryAbandoned { entry: abandoned });
				Ok(Outcome::Abandoned)
			}
			FailureClass::Transient => {
				let delay = {
					let mut rng = rand::thread_rng();
					self.backoff.jittered_ms(entry.retry_count, &mut rng)
				};
				let not_before = self
					.queue
					.now_ms()
					.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
				let retried = self
					.queue
					.schedule_retry(entry, &message, not_before)
					.await
					.map_err(stale)?;
				warn!(
					entry_id = %retried.id,
					retry_count = retried.retry_count,
					delay_ms = delay,
					error = %message,
					"Transient sync failure, retrying later"
				);
				Ok(Outcome::Retried)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lost_claims_are_skips() {
		assert!(is_lost_claim(&OutboxError::NotFound("sync_1".into())));
		assert!(is_lost_claim(&OutboxError::NotDue {
			id: "sync_1".into(),
			not_before: 5,
		}));
		assert!(!is_lost_claim(&OutboxError::EmptyId));
	}

	#[test]
	fn test_outcomes_fill_report() {
		let mut report = SyncReport::default();
		for outcome in [
			Outcome::Succeeded,
			Outcome::Succeeded,
			Outcome::Retried,
			Outcome::Abandoned,
			Outcome::Skipped,
		] {
			record(&mut report, outcome);
		}

		assert_eq!(report.succeeded, 2);
		assert_eq!(report.retried, 1);
		assert_eq!(report.abandoned, 1);
		assert_eq!(report.skipped, 1);
		assert_eq!(report.attempted(), 4);
	}
}
