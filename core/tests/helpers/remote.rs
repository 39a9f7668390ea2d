//! Scripted collaborators for the sync engine

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tether_core::{
	infra::sync::OutboxEntry,
	service::sync::{FailurePolicy, RemoteAuthority, RemoteError, RemoteId, RemoteRequest},
};

/// What the mock remote does with one request
#[derive(Debug, Clone)]
pub enum Reply {
	Accept(RemoteId),
	Fail(RemoteError),
	/// Never answers
	Hang,
}

impl Reply {
	pub fn network() -> Self {
		Self::Fail(RemoteError::Network("connection reset".to_string()))
	}

	pub fn rejected(reason: &str) -> Self {
		Self::Fail(RemoteError::Status {
			code: 422,
			message: reason.to_string(),
		})
	}
}

#[derive(Default)]
struct MockState {
	scripts: HashMap<String, VecDeque<Reply>>,
	calls: Vec<RemoteRequest>,
	active: HashMap<String, usize>,
	max_active_per_id: usize,
	active_total: usize,
	max_active_total: usize,
}

/// Remote authority answering from per-entry scripts
///
/// Requests without a scripted reply are accepted with id `remote-<entry id>`.
#[derive(Default)]
pub struct MockRemote {
	state: Mutex<MockState>,
	latency: Option<Duration>,
}

/// Decrements the active counters even when a request is cancelled
struct ActiveGuard<'a> {
	remote: &'a MockRemote,
	id: String,
}

impl Drop for ActiveGuard<'_> {
	fn drop(&mut self) {
		let mut state = self.remote.state.lock();
		if let Some(count) = state.active.get_mut(&self.id) {
			*count -= 1;
		}
		state.active_total -= 1;
	}
}

impl MockRemote {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_latency(latency: Duration) -> Self {
		Self {
			latency: Some(latency),
			..Self::default()
		}
	}

	pub fn script(&self, entry_id: &str, replies: impl IntoIterator<Item = Reply>) {
		self.state
			.lock()
			.scripts
			.entry(entry_id.to_string())
			.or_default()
			.extend(replies);
	}

	pub fn calls(&self) -> Vec<RemoteRequest> {
		self.state.lock().calls.clone()
	}

	/// Idempotency keys in the order requests arrived
	pub fn call_ids(&self) -> Vec<String> {
		self.state
			.lock()
			.calls
			.iter()
			.map(|call| call.idempotency_key.clone())
			.collect()
	}

	pub fn calls_for(&self, entry_id: &str) -> usize {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|call| call.idempotency_key == entry_id)
			.count()
	}

	/// Highest number of simultaneous requests seen for any single entry
	pub fn max_concurrent_per_entry(&self) -> usize {
		self.state.lock().max_active_per_id
	}

	pub fn max_concurrent(&self) -> usize {
		self.state.lock().max_active_total
	}
}

#[async_trait]
impl RemoteAuthority for MockRemote {
	async fn submit(&self, request: &RemoteRequest) -> Result<RemoteId, RemoteError> {
		let id = request.idempotency_key.clone();
		let reply = {
			let mut state = self.state.lock();
			state.calls.push(request.clone());

			let active = state.active.entry(id.clone()).or_default();
			*active += 1;
			let active = *active;
			state.max_active_per_id = state.max_active_per_id.max(active);
			state.active_total += 1;
			state.max_active_total = state.max_active_total.max(state.active_total);

			state.scripts.get_mut(&id).and_then(VecDeque::pop_front)
		};
		let _guard = ActiveGuard {
			remote: self,
			id: id.clone(),
		};

		if let Some(latency) = self.latency {
			tokio::time::sleep(latency).await;
		}

		match reply {
			Some(Reply::Accept(remote_id)) => Ok(remote_id),
			Some(Reply::Fail(error)) => Err(error),
			Some(Reply::Hang) => std::future::pending().await,
			None => Ok(format!("remote-{id}")),
		}
	}
}

/// Failure policy remembering every callback
#[derive(Default)]
pub struct RecordingPolicy {
	permanent: Mutex<Vec<(String, RemoteError)>>,
	abandoned: Mutex<Vec<String>>,
}

impl RecordingPolicy {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn permanent_failures(&self) -> Vec<(String, RemoteError)> {
		self.permanent.lock().clone()
	}

	pub fn abandoned(&self) -> Vec<String> {
		self.abandoned.lock().clone()
	}
}

#[async_trait]
impl FailurePolicy for RecordingPolicy {
	async fn on_permanent_failure(&self, entry: &OutboxEntry, error: &RemoteError) {
		self.permanent
			.lock()
			.push((entry.id.clone(), error.clone()));
	}

	async fn on_abandoned(&self, entry: &OutboxEntry) {
		self.abandoned.lock().push(entry.id.clone());
	}
}
