//! Atomic scopes over one or more collections
//!
//! An [`AtomicScope`] wraps a single database transaction. Every write made
//! through it commits together or not at all, and finishing it is an explicit
//! outcome: [`AtomicScope::commit`] or [`AtomicScope::abort`]. A scope that is
//! dropped without either is rolled back.

use super::{
	record::{RecordKey, StoredRecord},
	schema::CollectionInfo,
	table,
};
use sea_orm::{ConnectionTrait, DatabaseTransaction, DbErr, QueryResult, Statement};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

/// Access mode of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
	ReadOnly,
	ReadWrite,
}

/// Errors raised by atomic scopes
#[derive(Debug, Error)]
pub enum TxError {
	#[error("collections not present in store: {}", .0.join(", "))]
	MissingCollections(Vec<String>),

	#[error("collection {collection} is not part of this scope")]
	NotInScope { collection: String },

	#[error("cannot write to {collection} from a read-only scope")]
	ReadOnly { collection: String },

	#[error("record for {collection} has no key at '{key_path}'")]
	MissingKey { collection: String, key_path: String },

	#[error("record for {collection} has an unusable key at '{key_path}'")]
	InvalidKey { collection: String, key_path: String },

	#[error("record for {collection} is not a JSON object")]
	NotAnObject { collection: String },

	#[error("index {index} does not exist on {collection}")]
	UnknownIndex { collection: String, index: String },

	#[error("constraint violated on {collection}: {message}")]
	Constraint { collection: String, message: String },

	#[error("record {key} in {collection} is not valid JSON: {source}")]
	Corrupt {
		collection: String,
		key: RecordKey,
		#[source]
		source: serde_json::Error,
	},

	#[error("store handle is closed")]
	Closed,

	#[error("database error: {0}")]
	Database(#[from] DbErr),
}

/// A unit of work spanning a fixed set of collections
pub struct AtomicScope {
	txn: DatabaseTransaction,
	mode: TxMode,
	collections: BTreeMap<String, Arc<CollectionInfo>>,
	store: String,
	// Held for the scope's lifetime so read-write scopes on a handle never interleave
	_write_gate: Option<OwnedMutexGuard<()>>,
}

impl AtomicScope {
	pub(crate) fn new(
		txn: DatabaseTransaction,
		mode: TxMode,
		collections: BTreeMap<String, Arc<CollectionInfo>>,
		store: String,
		write_gate: Option<OwnedMutexGuard<()>>,
	) -> Self {
		trace!(
			store = %store,
			?mode,
			collections = ?collections.keys().collect::<Vec<_>>(),
			"Atomic scope opened"
		);

		Self {
			txn,
			mode,
			collections,
			store,
			_write_gate: write_gate,
		}
	}

	/// Read-only or read-write
	pub fn mode(&self) -> TxMode {
		self.mode
	}

	/// Collections this scope may touch
	pub fn collections(&self) -> impl Iterator<Item = &str> {
		self.collections.keys().map(String::as_str)
	}

	/// Whether `collection` is part of this scope
	pub fn contains(&self, collection: &str) -> bool {
		self.collections.contains_key(collection)
	}

	fn readable(&self, collection: &str) -> Result<&CollectionInfo, TxError> {
		self.collections
			.get(collection)
			.map(Arc::as_ref)
			.ok_or_else(|| TxError::NotInScope {
				collection: collection.to_string(),
			})
	}

	fn writable(&self, collection: &str) -> Result<&CollectionInfo, TxError> {
		let info = self.readable(collection)?;
		match self.mode {
			TxMode::ReadWrite => Ok(info),
			TxMode::ReadOnly => Err(TxError::ReadOnly {
				collection: collection.to_string(),
			}),
		}
	}

	/// Key a record would be stored under, `None` for a sequential record without one yet
	pub fn key_of(&self, collection: &str, value: &Value) -> Result<Option<RecordKey>, TxError> {
		let info = self.readable(collection)?;
		table::record_key_for(info, value)
	}

	/// Record by key
	pub async fn get(
		&self,
		collection: &str,
		key: &RecordKey,
	) -> Result<Option<StoredRecord>, TxError> {
		let info = self.readable(collection)?;
		table::get(&self.txn, info, key).await
	}

	/// Inserts or replaces a record and returns the key it was stored under
	///
	/// Sequential collections assign a key when the record has none and write it
	/// back into the record's key path.
	pub async fn put(&self, collection: &str, value: Value) -> Result<RecordKey, TxError> {
		let info = self.writable(collection)?;
		let (key, _) = table::put(&self.txn, info, value).await?;
		Ok(key)
	}

	/// Like [`Self::put`] but also returns the record as stored
	pub async fn put_returning(
		&self,
		collection: &str,
		value: Value,
	) -> Result<StoredRecord, TxError> {
		let info = self.writable(collection)?;
		let (key, value) = table::put(&self.txn, info, value).await?;
		Ok(StoredRecord { key, value })
	}

	/// Removes a record, returning whether it existed
	pub async fn delete(&self, collection: &str, key: &RecordKey) -> Result<bool, TxError> {
		let info = self.writable(collection)?;
		table::delete(&self.txn, info, key).await
	}

	/// Every record in key order
	pub async fn get_all(&self, collection: &str) -> Result<Vec<StoredRecord>, TxError> {
		let info = self.readable(collection)?;
		table::scan(&self.txn, info).await
	}

	/// Number of records in the collection
	pub async fn count(&self, collection: &str) -> Result<u64, TxError> {
		let info = self.readable(collection)?;
		table::count(&self.txn, info).await
	}

	/// Deletes every record and returns how many were removed
	pub async fn clear(&self, collection: &str) -> Result<u64, TxError> {
		let info = self.writable(collection)?;
		table::clear(&self.txn, info).await
	}

	/// Records whose index value equals `value`, in key order
	pub async fn get_all_by_index(
		&self,
		collection: &str,
		index: &str,
		value: &Value,
	) -> Result<Vec<StoredRecord>, TxError> {
		let info = self.readable(collection)?;
		table::get_all_by_index(&self.txn, info, index, value).await
	}

	/// Runs a query written against collections of this scope
	pub(crate) async fn query_records(
		&self,
		collection: &str,
		statement: Statement,
	) -> Result<Vec<StoredRecord>, TxError> {
		let info = self.readable(collection)?;
		let rows = self.txn.query_all(statement).await?;
		rows.iter()
			.map(|row| table::decode_record(&info.name, row))
			.collect()
	}

	pub(crate) async fn query_one(
		&self,
		statement: Statement,
	) -> Result<Option<QueryResult>, TxError> {
		Ok(self.txn.query_one(statement).await?)
	}

	/// Makes every write of the scope durable at once
	pub async fn commit(self) -> Result<(), TxError> {
		self.txn.commit().await?;
		debug!(store = %self.store, mode = ?self.mode, "Atomic scope committed");
		Ok(())
	}

	/// Discards every write of the scope
	pub async fn abort(self) -> Result<(), TxError> {
		self.txn.rollback().await?;
		debug!(store = %self.store, mode = ?self.mode, "Atomic scope aborted");
		Ok(())
	}
}
