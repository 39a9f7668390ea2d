//! Remote authority collaborator
//!
//! The sync engine only needs one narrow operation from the server side:
//! submit a change and get back the id the server knows the record by. Errors
//! are classified so the engine can decide between retrying and giving up.

use crate::infra::{
	db::RecordKey,
	sync::{Operation, OutboxEntry},
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Identifier assigned by the remote authority
pub type RemoteId = String;

/// One replayed change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
	/// Stable across retries so the remote side can drop duplicates
	pub idempotency_key: String,
	pub resource_type: String,
	pub operation: Operation,
	pub record_key: Option<RecordKey>,
	pub payload: Value,
}

impl RemoteRequest {
	/// Request describing one outbox entry
	pub fn from_entry(entry: &OutboxEntry) -> Self {
		Self {
			idempotency_key: entry.id.clone(),
			resource_type: entry.collection.clone(),
			operation: entry.operation,
			record_key: entry.record_key.clone(),
			payload: entry.data.clone(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
	/// Expected to succeed on retry
	Transient,
	/// Will keep failing until the payload changes
	Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
	#[error("network error: {0}")]
	Network(String),

	#[error("request timed out after {after_ms}ms")]
	Timeout { after_ms: u64 },

	#[error("remote returned {code}: {message}")]
	Status { code: u16, message: String },

	#[error("remote rejected the change: {reason}")]
	Rejected { reason: String },
}

impl RemoteError {
	/// How the failure policy should treat this error
	pub fn class(&self) -> FailureClass {
		match self {
			Self::Network(_) | Self::Timeout { .. } => FailureClass::Transient,
			Self::Status { code, .. } => match code {
				408 | 425 | 429 => FailureClass::Transient,
				500..=599 => FailureClass::Transient,
				_ => FailureClass::Permanent,
			},
			Self::Rejected { .. } => FailureClass::Permanent,
		}
	}

	/// Whether a retry may succeed without any change
	pub fn is_transient(&self) -> bool {
		self.class() == FailureClass::Transient
	}
}

/// Server side of synchronization
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
	async fn submit(&self, request: &RemoteRequest) -> Result<RemoteId, RemoteError>;
}
