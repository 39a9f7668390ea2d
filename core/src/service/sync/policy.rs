//! Failure policy collaborator
//!
//! Owned by the application: decides what the user sees when a change cannot
//! be delivered. The engine only reports; it never makes that decision.

use super::remote::RemoteError;
use crate::infra::sync::OutboxEntry;
use async_trait::async_trait;
use tracing::error;

#[async_trait]
pub trait FailurePolicy: Send + Sync {
	/// The remote authority rejected the payload itself
	async fn on_permanent_failure(&self, entry: &OutboxEntry, error: &RemoteError);

	/// Transient failures used up the retry budget
	async fn on_abandoned(&self, entry: &OutboxEntry);
}

/// Default policy: log and leave the entry for the application to inspect
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPolicy;

#[async_trait]
impl FailurePolicy for LoggingPolicy {
	async fn on_permanent_failure(&self, entry: &OutboxEntry, error: &RemoteError) {
		error!(
			entry_id = %entry.id,
			collection = %entry.collection,
			operation = %entry.operation,
			error = %error,
			"Change rejected by remote authority"
		);
	}

	async fn on_abandoned(&self, entry: &OutboxEntry) {
		error!(
			entry_id = %entry.id,
			collection = %entry.collection,
			retries = entry.retry_count,
			last_error = entry.last_error.as_deref().unwrap_or_default(),
			"Change abandoned after exhausting retries"
		);
	}
}
