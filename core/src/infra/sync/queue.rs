//! Outbox data access
//!
//! Every operation runs inside one atomic scope and re-reads whatever its
//! decision depends on inside that scope, so concurrent connections and
//! concurrent sync cycles cannot act on a stale view of an entry. The `*_in`
//! variants let callers fold outbox writes into a scope of their own.

use super::{
	entry::{EntryStatus, Operation, OutboxEntry, SYNC_QUEUE},
	time_source::TimeSource,
};
use crate::infra::db::{
	record::RECORD_COLUMNS,
	schema::{json_extract, quote_ident},
	table::stmt,
	AtomicScope, RecordKey, StoreHandle, TxError, TxMode,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Fields written onto domain records by the outbox itself, never sent upstream
const LOCAL_FIELDS: [&str; 2] = ["synced", "remoteId"];

#[derive(Debug, Error)]
pub enum OutboxError {
	#[error(transparent)]
	Store(#[from] TxError),

	#[error("outbox entry {0} not found")]
	NotFound(String),

	#[error("outbox entry ids must not be empty")]
	EmptyId,

	#[error("outbox entry {0} is in flight and cannot be replaced")]
	InFlight(String),

	#[error("outbox entry {id} is held by another replay attempt")]
	ClaimLost { id: String },

	#[error("outbox entry {id} cannot move from {from} to {to}")]
	InvalidTransition {
		id: String,
		from: EntryStatus,
		to: EntryStatus,
	},

	#[error("outbox entry {id} is not due until {not_before}")]
	NotDue { id: String, not_before: i64 },

	#[error("record {key} in {collection} has an earlier change still open")]
	RecordBusy { collection: String, key: RecordKey },

	#[error("record for {collection} has no key to delete by")]
	MissingRecordKey { collection: String },

	#[error("outbox record {key} is malformed: {source}")]
	Decode {
		key: RecordKey,
		#[source]
		source: serde_json::Error,
	},

	#[error("outbox entry {id} could not be encoded: {source}")]
	Encode {
		id: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Outcome of writing a domain record together with its outbox entry
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
	/// Key of the domain record
	pub key: RecordKey,
	/// Entry now carrying the change, `None` when it cancelled out a pending create
	pub entry: Option<OutboxEntry>,
}

fn field(path: &str) -> String {
	json_extract(None, path)
}

fn queue_table() -> String {
	quote_ident(SYNC_QUEUE)
}

fn strip_local_fields(mut value: Value) -> Value {
	if let Some(object) = value.as_object_mut() {
		for name in LOCAL_FIELDS {
			object.remove(name);
		}
	}
	value
}

/// Moves a claimed in-flight entry on to `next`
///
/// Fails with [`OutboxError::ClaimLost`] when the stored entry is in flight
/// under a different claim, so a late outcome never lands on a newer attempt.
fn release_claim(
	stored: &mut OutboxEntry,
	claimed: &OutboxEntry,
	next: EntryStatus,
) -> Result<(), OutboxError> {
	if stored.status == EntryStatus::InFlight && stored.claim != claimed.claim {
		return Err(OutboxError::ClaimLost {
			id: stored.id.clone(),
		});
	}
	stored.transition(next)?;
	stored.claim = None;
	Ok(())
}

/// Durable queue of changes waiting for the remote authority
#[derive(Clone)]
pub struct SyncQueue {
	store: StoreHandle,
	time: Arc<dyn TimeSource>,
}

impl SyncQueue {
	/// Queue over a store that has the outbox collection
	pub fn new(store: StoreHandle, time: Arc<dyn TimeSource>) -> Result<Self, OutboxError> {
		if !store.has_collection(SYNC_QUEUE) {
			return Err(TxError::MissingCollections(vec![SYNC_QUEUE.to_string()]).into());
		}
		Ok(Self { store, time })
	}

	/// Store the outbox lives in
	pub fn store(&self) -> &StoreHandle {
		&self.store
	}

	/// Current time from the queue's clock
	pub fn now_ms(&self) -> i64 {
		self.time.now_ms()
	}

	async fn scope(&self, collections: &[&str], mode: TxMode) -> Result<AtomicScope, OutboxError> {
		Ok(self.store.transaction(collections, mode).await?)
	}

	/// Scope over every collection, for status changes that may touch the domain record
	async fn wide_scope(&self) -> Result<AtomicScope, OutboxError> {
		let collections: Vec<&str> = self.store.collection_names().collect();
		self.scope(&collections, TxMode::ReadWrite).await
	}

	async fn load(
		&self,
		scope: &AtomicScope,
		id: &str,
	) -> Result<Option<OutboxEntry>, OutboxError> {
		scope
			.get(SYNC_QUEUE, &RecordKey::from(id))
			.await?
			.map(|record| OutboxEntry::from_record(&record))
			.transpose()
	}

	async fn require(&self, scope: &AtomicScope, id: &str) -> Result<OutboxEntry, OutboxError> {
		self.load(scope, id)
			.await?
			.ok_or_else(|| OutboxError::NotFound(id.to_string()))
	}

	async fn save(&self, scope: &AtomicScope, entry: &OutboxEntry) -> Result<(), OutboxError> {
		scope.put(SYNC_QUEUE, entry.to_value()?).await?;
		Ok(())
	}

	async fn query(
		&self,
		scope: &AtomicScope,
		sql: String,
		values: Vec<sea_orm::Value>,
	) -> Result<Vec<OutboxEntry>, OutboxError> {
		scope
			.query_records(SYNC_QUEUE, stmt(sql, values))
			.await?
			.iter()
			.map(OutboxEntry::from_record)
			.collect()
	}

	async fn count(
		&self,
		scope: &AtomicScope,
		sql: String,
		values: Vec<sea_orm::Value>,
	) -> Result<i64, OutboxError> {
		let row = scope.query_one(stmt(sql, values)).await?;
		Ok(match row {
			Some(row) => row.try_get::<i64>("", "n").map_err(TxError::from)?,
			None => 0,
		})
	}

	async fn next_sequence(&self, scope: &AtomicScope) -> Result<i64, OutboxError> {
		self.count(
			scope,
			format!(
				"SELECT COALESCE(MAX({}), 0) + 1 AS n FROM {}",
				field("sequence"),
				queue_table()
			),
			Vec::new(),
		)
		.await
	}

	/// Adds an entry, or updates it in place when its id is already pending
	///
	/// A pending entry keeps its place in the queue and its retry state. An id
	/// whose previous entry reached a terminal state starts over as a fresh
	/// pending entry. Replacing an in-flight entry is refused.
	pub async fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadWrite).await?;
		let entry = self.enqueue_in(&scope, entry).await?;
		scope.commit().await?;
		Ok(entry)
	}

	/// Enqueues inside a caller's scope, so the entry commits with its write
	pub async fn enqueue_in(
		&self,
		scope: &AtomicScope,
		mut entry: OutboxEntry,
	) -> Result<OutboxEntry, OutboxError> {
		if entry.id.is_empty() {
			return Err(OutboxError::EmptyId);
		}

		match self.load(scope, &entry.id).await? {
			Some(existing) if existing.status == EntryStatus::InFlight => {
				return Err(OutboxError::InFlight(entry.id));
			}
			Some(existing) if existing.status == EntryStatus::Pending => {
				entry.status = EntryStatus::Pending;
				entry.timestamp = existing.timestamp;
				entry.sequence = existing.sequence;
				entry.retry_count = existing.retry_count;
				entry.not_before = existing.not_before;
				entry.last_attempt_at = existing.last_attempt_at;
				entry.claim = None;
				entry.last_error = existing.last_error;
				entry.remote_id = None;
				debug!(
					entry_id = %entry.id,
					operation = %entry.operation,
					"Updated pending outbox entry in place"
				);
			}
			previous => {
				entry.status = EntryStatus::Pending;
				entry.retry_count = 0;
				entry.timestamp = self.now_ms();
				entry.sequence = self.next_sequence(scope).await?;
				entry.last_attempt_at = None;
				entry.claim = None;
				entry.not_before = None;
				entry.last_error = None;
				entry.remote_id = None;
				debug!(
					entry_id = %entry.id,
					operation = %entry.operation,
					collection = %entry.collection,
					recreated = previous.is_some(),
					"Enqueued outbox entry"
				);
			}
		}

		self.save(scope, &entry).await?;
		Ok(entry)
	}

	/// Writes a domain record and its outbox entry in one scope
	///
	/// The record is flagged `synced: false` (deletes remove it locally). When
	/// the record already has a pending entry the change is folded into it and
	/// that entry's id is kept instead of `entry_id`.
	pub async fn stage(
		&self,
		collection: &str,
		record: Value,
		operation: Operation,
		entry_id: impl Into<String>,
	) -> Result<Staged, OutboxError> {
		let scope = self.scope(&[collection, SYNC_QUEUE], TxMode::ReadWrite).await?;
		let staged = self
			.stage_in(&scope, collection, record, operation, entry_id.into())
			.await?;
		scope.commit().await?;
		Ok(staged)
	}

	/// Enqueues as part of a staged local write
	pub async fn stage_in(
		&self,
		scope: &AtomicScope,
		collection: &str,
		mut record: Value,
		operation: Operation,
		entry_id: String,
	) -> Result<Staged, OutboxError> {
		let (key, data) = match operation {
			Operation::Delete => {
				let key = scope
					.key_of(collection, &record)?
					.ok_or_else(|| OutboxError::MissingRecordKey {
						collection: collection.to_string(),
					})?;
				scope.delete(collection, &key).await?;
				(key, strip_local_fields(record))
			}
			Operation::Create | Operation::Update => {
				if let Some(object) = record.as_object_mut() {
					object.insert("synced".to_string(), Value::Bool(false));
				}
				let stored = scope.put_returning(collection, record).await?;
				(stored.key, strip_local_fields(stored.value))
			}
		};

		if let Some(mut open) = self.latest_open_for(scope, collection, &key).await? {
			if open.status == EntryStatus::Pending {
				// A create that was already attempted may exist remotely
				let folded = match open.operation.coalesce(operation) {
					None if open.last_attempt_at.is_some() => Some(Operation::Delete),
					folded => folded,
				};

				return match folded {
					Some(folded) => {
						debug!(
							entry_id = %open.id,
							from = %open.operation,
							to = %folded,
							"Coalesced change into pending outbox entry"
						);
						open.operation = folded;
						open.data = data;
						self.save(scope, &open).await?;
						Ok(Staged {
							key,
							entry: Some(open),
						})
					}
					None => {
						debug!(entry_id = %open.id, "Delete cancelled pending create");
						scope
							.delete(SYNC_QUEUE, &RecordKey::from(open.id.as_str()))
							.await?;
						Ok(Staged { key, entry: None })
					}
				};
			}
		}

		let entry = OutboxEntry::new(entry_id, collection, operation, data).for_record(key.clone());
		let entry = self.enqueue_in(scope, entry).await?;
		Ok(Staged {
			key,
			entry: Some(entry),
		})
	}

	async fn latest_open_for(
		&self,
		scope: &AtomicScope,
		collection: &str,
		key: &RecordKey,
	) -> Result<Option<OutboxEntry>, OutboxError> {
		let mut found = self
			.query(
				scope,
				format!(
					"SELECT {RECORD_COLUMNS} FROM {} \
					 WHERE {} = ? AND {} = ? AND {} IN ('pending', 'in_flight') \
					 ORDER BY {} DESC, {} DESC LIMIT 1",
					queue_table(),
					field("collection"),
					field("recordKey"),
					field("status"),
					field("timestamp"),
					field("sequence"),
				),
				vec![collection.into(), key.to_sql()],
			)
			.await?;
		Ok(found.pop())
	}

	/// Due pending entries in FIFO order, at most one per domain record
	///
	/// An entry is held back while an earlier entry for the same record is
	/// still pending or in flight.
	pub async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadOnly).await?;
		let batch = self.next_batch_in(&scope, limit).await?;
		scope.commit().await?;
		Ok(batch)
	}

	/// Due entries in replay order, read inside `scope`
	pub async fn next_batch_in(
		&self,
		scope: &AtomicScope,
		limit: usize,
	) -> Result<Vec<OutboxEntry>, OutboxError> {
		let q = |path: &str| json_extract(Some("q"), path);
		let p = |path: &str| json_extract(Some("p"), path);
		let table = queue_table();

		let sql = format!(
			"SELECT {RECORD_COLUMNS} FROM {table} AS q \
			 WHERE {q_status} = 'pending' \
			   AND COALESCE({q_not_before}, 0) <= ? \
			   AND NOT EXISTS ( \
			     SELECT 1 FROM {table} AS p \
			     WHERE p.record_key <> q.record_key \
			       AND {p_collection} = {q_collection} \
			       AND {p_key} = {q_key} \
			       AND {p_status} IN ('pending', 'in_flight') \
			       AND ({p_ts} < {q_ts} OR ({p_ts} = {q_ts} AND {p_seq} < {q_seq})) \
			   ) \
			 ORDER BY {q_ts}, {q_seq} \
			 LIMIT ?",
			q_status = q("status"),
			q_not_before = q("notBefore"),
			q_collection = q("collection"),
			q_key = q("recordKey"),
			q_ts = q("timestamp"),
			q_seq = q("sequence"),
			p_status = p("status"),
			p_collection = p("collection"),
			p_key = p("recordKey"),
			p_ts = p("timestamp"),
			p_seq = p("sequence"),
		);

		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let batch = self
			.query(scope, sql, vec![self.now_ms().into(), limit.into()])
			.await?;
		trace!(entries = batch.len(), "Fetched outbox batch");
		Ok(batch)
	}

	/// Number of other open entries for the same record that must finish first
	async fn earlier_open(
		&self,
		scope: &AtomicScope,
		entry: &OutboxEntry,
	) -> Result<i64, OutboxError> {
		let Some((collection, key)) = entry.target() else {
			return Ok(0);
		};

		self.count(
			scope,
			format!(
				"SELECT COUNT(*) AS n FROM {table} \
				 WHERE record_key <> ? AND {collection_f} = ? AND {key_f} = ? \
				   AND ({status} = 'in_flight' OR ({status} = 'pending' \
				     AND ({ts} < ? OR ({ts} = ? AND {seq} < ?))))",
				table = queue_table(),
				collection_f = field("collection"),
				key_f = field("recordKey"),
				status = field("status"),
				ts = field("timestamp"),
				seq = field("sequence"),
			),
			vec![
				entry.id.clone().into(),
				collection.into(),
				key.to_sql(),
				entry.timestamp.into(),
				entry.timestamp.into(),
				entry.sequence.into(),
			],
		)
		.await
	}

	async fn other_open(
		&self,
		scope: &AtomicScope,
		entry: &OutboxEntry,
	) -> Result<i64, OutboxError> {
		let Some((collection, key)) = entry.target() else {
			return Ok(0);
		};

		self.count(
			scope,
			format!(
				"SELECT COUNT(*) AS n FROM {} WHERE record_key <> ? AND {} = ? AND {} = ? \
				 AND {} IN ('pending', 'in_flight')",
				queue_table(),
				field("collection"),
				field("recordKey"),
				field("status"),
			),
			vec![entry.id.clone().into(), collection.into(), key.to_sql()],
		)
		.await
	}

	/// Claims a pending entry for replay
	///
	/// Fails when the entry is not pending, not yet due, or an earlier change
	/// to the same record is still open. At most one claim per id can succeed.
	/// The returned entry carries the claim token the outcome must present.
	pub async fn mark_in_flight(&self, id: &str) -> Result<OutboxEntry, OutboxError> {
		self.mark_in_flight_with(id, OutboxEntry::generate_claim())
			.await
	}

	/// Like [`Self::mark_in_flight`] with a caller-chosen claim token
	pub async fn mark_in_flight_with(
		&self,
		id: &str,
		claim: String,
	) -> Result<OutboxEntry, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadWrite).await?;
		let mut entry = self.require(&scope, id).await?;
		let now = self.now_ms();

		if let (EntryStatus::Pending, Some(not_before)) = (entry.status, entry.not_before) {
			if not_before > now {
				return Err(OutboxError::NotDue {
					id: entry.id,
					not_before,
				});
			}
		}

		entry.transition(EntryStatus::InFlight)?;

		if self.earlier_open(&scope, &entry).await? > 0 {
			if let Some((collection, key)) = entry.target() {
				return Err(OutboxError::RecordBusy {
					collection: collection.to_string(),
					key: key.clone(),
				});
			}
		}

		entry.last_attempt_at = Some(now);
		entry.claim = Some(claim);
		self.save(&scope, &entry).await?;
		scope.commit().await?;

		debug!(entry_id = %entry.id, attempt = entry.retry_count + 1, "Outbox entry in flight");
		Ok(entry)
	}

	/// Records a successful replay and flags the domain record as synced
	///
	/// `claimed` is the entry as returned by [`Self::mark_in_flight`]. The flag
	/// is only set when no other change to the record is still open.
	pub async fn mark_succeeded(
		&self,
		claimed: &OutboxEntry,
		remote_id: Option<String>,
	) -> Result<OutboxEntry, OutboxError> {
		let scope = self.wide_scope().await?;
		let mut entry = self.require(&scope, &claimed.id).await?;

		release_claim(&mut entry, claimed, EntryStatus::Succeeded)?;
		entry.last_error = None;
		entry.not_before = None;
		entry.remote_id = remote_id;
		self.save(&scope, &entry).await?;

		if let Some((collection, key)) = entry.target() {
			let record_synced = entry.operation != Operation::Delete
				&& scope.contains(collection)
				&& self.other_open(&scope, &entry).await? == 0;

			if record_synced {
				if let Some(mut record) = scope.get(collection, key).await? {
					if let Some(object) = record.value.as_object_mut() {
						object.insert("synced".to_string(), Value::Bool(true));
						if let Some(remote_id) = &entry.remote_id {
							object.insert("remoteId".to_string(), json!(remote_id));
						}
					}
					scope.put(collection, record.value).await?;
				}
			}
		}

		scope.commit().await?;
		debug!(entry_id = %entry.id, remote_id = ?entry.remote_id, "Outbox entry succeeded");
		Ok(entry)
	}

	async fn update<F>(&self, id: &str, apply: F) -> Result<OutboxEntry, OutboxError>
	where
		F: FnOnce(&mut OutboxEntry) -> Result<(), OutboxError>,
	{
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadWrite).await?;
		let mut entry = self.require(&scope, id).await?;
		apply(&mut entry)?;
		self.save(&scope, &entry).await?;
		scope.commit().await?;
		Ok(entry)
	}

	/// Permanent failure: no further retries
	pub async fn mark_failed(
		&self,
		claimed: &OutboxEntry,
		error: &str,
	) -> Result<OutboxEntry, OutboxError> {
		let entry = self
			.update(&claimed.id, |entry| {
				release_claim(entry, claimed, EntryStatus::Failed)?;
				entry.last_error = Some(error.to_string());
				entry.not_before = None;
				Ok(())
			})
			.await?;
		debug!(entry_id = %entry.id, "Outbox entry failed");
		Ok(entry)
	}

	/// Returns an in-flight entry to the queue after a transient failure
	pub async fn schedule_retry(
		&self,
		claimed: &OutboxEntry,
		error: &str,
		not_before: i64,
	) -> Result<OutboxEntry, OutboxError> {
		let entry = self
			.update(&claimed.id, |entry| {
				release_claim(entry, claimed, EntryStatus::Pending)?;
				entry.retry_count = entry.retry_count.saturating_add(1);
				entry.last_error = Some(error.to_string());
				entry.not_before = Some(not_before);
				Ok(())
			})
			.await?;
		debug!(
			entry_id = %entry.id,
			retry_count = entry.retry_count,
			not_before,
			"Outbox entry scheduled for retry"
		);
		Ok(entry)
	}

	/// `failed -> abandoned`
	pub async fn mark_abandoned(&self, id: &str) -> Result<OutboxEntry, OutboxError> {
		self.update(id, |entry| entry.transition(EntryStatus::Abandoned))
			.await
	}

	/// Transient failure with the retry budget spent: the attempt is counted,
	/// then the entry goes through `failed` to `abandoned` in one scope
	pub async fn abandon(
		&self,
		claimed: &OutboxEntry,
		error: &str,
	) -> Result<OutboxEntry, OutboxError> {
		let entry = self
			.update(&claimed.id, |entry| {
				release_claim(entry, claimed, EntryStatus::Failed)?;
				entry.retry_count = entry.retry_count.saturating_add(1);
				entry.last_error = Some(error.to_string());
				entry.not_before = None;
				entry.transition(EntryStatus::Abandoned)
			})
			.await?;
		debug!(entry_id = %entry.id, retry_count = entry.retry_count, "Outbox entry abandoned");
		Ok(entry)
	}

	/// Requeues in-flight entries whose attempt started before `cutoff_ms`
	///
	/// Such entries belong to a cycle that crashed or was cancelled. Entries
	/// whose claim token is in `keep` are still being replayed and stay put.
	/// The retry count is left unchanged since the attempt never completed.
	pub async fn recover_stale(
		&self,
		cutoff_ms: i64,
		keep: &HashSet<String>,
	) -> Result<Vec<OutboxEntry>, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadWrite).await?;
		let stale = self
			.query(
				&scope,
				format!(
					"SELECT {RECORD_COLUMNS} FROM {} WHERE {} = 'in_flight' \
					 AND COALESCE({}, 0) < ? ORDER BY {}, {}",
					queue_table(),
					field("status"),
					field("lastAttemptAt"),
					field("timestamp"),
					field("sequence"),
				),
				vec![cutoff_ms.into()],
			)
			.await?;

		let mut recovered = Vec::with_capacity(stale.len());
		for mut entry in stale {
			if entry.claim.as_ref().is_some_and(|claim| keep.contains(claim)) {
				continue;
			}
			entry.transition(EntryStatus::Pending)?;
			entry.claim = None;
			entry.not_before = None;
			self.save(&scope, &entry).await?;
			recovered.push(entry);
		}

		scope.commit().await?;
		if !recovered.is_empty() {
			info!(count = recovered.len(), "Requeued stale in-flight outbox entries");
		}
		Ok(recovered)
	}

	/// Deletes succeeded entries that completed before `before_ms`
	pub async fn prune(&self, before_ms: i64) -> Result<u64, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadWrite).await?;
		let expired = self
			.query(
				&scope,
				format!(
					"SELECT {RECORD_COLUMNS} FROM {} WHERE {} = 'succeeded' \
					 AND COALESCE({}, {}) < ?",
					queue_table(),
					field("status"),
					field("lastAttemptAt"),
					field("timestamp"),
				),
				vec![before_ms.into()],
			)
			.await?;

		let mut pruned = 0;
		for entry in &expired {
			if scope
				.delete(SYNC_QUEUE, &RecordKey::from(entry.id.as_str()))
				.await?
			{
				pruned += 1;
			}
		}

		scope.commit().await?;
		if pruned > 0 {
			debug!(pruned, "Pruned succeeded outbox entries");
		}
		Ok(pruned)
	}

	/// Entry by id
	pub async fn get(&self, id: &str) -> Result<Option<OutboxEntry>, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadOnly).await?;
		let entry = self.load(&scope, id).await?;
		scope.commit().await?;
		Ok(entry)
	}

	/// Entries in FIFO order, optionally filtered by status
	pub async fn list(&self, status: Option<EntryStatus>) -> Result<Vec<OutboxEntry>, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadOnly).await?;
		let (filter, values) = match status {
			Some(status) => (
				format!("WHERE {} = ?", field("status")),
				vec![status.to_string().into()],
			),
			None => (String::new(), Vec::new()),
		};

		let entries = self
			.query(
				&scope,
				format!(
					"SELECT {RECORD_COLUMNS} FROM {} {filter} ORDER BY {}, {}",
					queue_table(),
					field("timestamp"),
					field("sequence"),
				),
				values,
			)
			.await?;
		scope.commit().await?;
		Ok(entries)
	}

	/// Every entry, open or not, that targets one domain record
	pub async fn entries_for(
		&self,
		collection: &str,
		key: &RecordKey,
	) -> Result<Vec<OutboxEntry>, OutboxError> {
		let scope = self.scope(&[SYNC_QUEUE], TxMode::ReadOnly).await?;
		let mut entries = scope
			.get_all_by_index(SYNC_QUEUE, "target", &json!([collection, key.to_json()]))
			.await?
			.iter()
			.map(OutboxEntry::from_record)
			.collect::<Result<Vec<_>, _>>()?;
		scope.commit().await?;

		entries.sort_by_key(|entry| (entry.timestamp, entry.sequence));
		Ok(entries)
	}

	/// Number of entries per status
	pub async fn status_counts(&self) -> Result<BTreeMap<EntryStatus, u64>, OutboxError> {
		let mut counts: BTreeMap<EntryStatus, u64> =
			EntryStatus::ALL.into_iter().map(|status| (status, 0)).collect();
		for entry in self.list(None).await? {
			*counts.entry(entry.status).or_default() += 1;
		}
		Ok(counts)
	}
}
