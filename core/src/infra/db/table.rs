//! Table-level operations shared by atomic scopes and migration steps
//!
//! Everything here is generic over [`ConnectionTrait`] so the same code runs
//! against a plain connection, a scope's transaction or the upgrade
//! transaction of the migration engine.

use super::{
	record::{
		json_to_sql, multi_entry_values, value_at_path, RecordKey, StoredRecord, RECORD_COLUMNS,
	},
	schema::{
		quote_ident, side_table_name, sql_index_name, CollectionInfo, IndexSpec, KeyPath,
		KeyStrategy, COLLECTIONS_TABLE, INDEXES_TABLE,
	},
	scope::TxError,
};
use sea_orm::{ConnectionTrait, DbBackend, DbErr, QueryResult, SqlErr, Statement};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

pub(crate) fn stmt(sql: impl Into<String>, values: Vec<sea_orm::Value>) -> Statement {
	Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}

pub(crate) async fn table_exists<C: ConnectionTrait>(conn: &C, name: &str) -> Result<bool, DbErr> {
	let row = conn
		.query_one(stmt(
			"SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
			vec![name.into()],
		))
		.await?;

	Ok(match row {
		Some(row) => row.try_get::<i64>("", "n")? > 0,
		None => false,
	})
}

/// Creates the schema metadata tables if they are missing
pub(crate) async fn ensure_meta_tables<C: ConnectionTrait>(conn: &C) -> Result<(), DbErr> {
	conn.execute_unprepared(&format!(
		r#"
		CREATE TABLE IF NOT EXISTS {COLLECTIONS_TABLE} (
			name TEXT PRIMARY KEY NOT NULL,
			key_path TEXT NOT NULL,
			key_strategy TEXT NOT NULL,
			created_version INTEGER NOT NULL
		)
		"#
	))
	.await?;

	conn.execute_unprepared(&format!(
		r#"
		CREATE TABLE IF NOT EXISTS {INDEXES_TABLE} (
			collection TEXT NOT NULL,
			name TEXT NOT NULL,
			key_path TEXT NOT NULL,
			is_unique INTEGER NOT NULL DEFAULT 0,
			multi_entry INTEGER NOT NULL DEFAULT 0,
			PRIMARY KEY (collection, name)
		)
		"#
	))
	.await?;

	Ok(())
}

/// Reads the declared collections and their indexes from the metadata tables
pub(crate) async fn load_schema<C: ConnectionTrait>(
	conn: &C,
) -> Result<BTreeMap<String, CollectionInfo>, DbErr> {
	let mut schema = BTreeMap::new();
	if !table_exists(conn, COLLECTIONS_TABLE).await? {
		return Ok(schema);
	}

	let rows = conn
		.query_all(Statement::from_string(
			DbBackend::Sqlite,
			format!("SELECT name, key_path, key_strategy FROM {COLLECTIONS_TABLE} ORDER BY name"),
		))
		.await?;

	for row in rows {
		let name: String = row.try_get("", "name")?;
		let key_path: String = row.try_get("", "key_path")?;
		let strategy: String = row.try_get("", "key_strategy")?;
		let key_strategy = KeyStrategy::from_str(&strategy)
			.map_err(|_| DbErr::Type(format!("unknown key strategy '{strategy}' for {name}")))?;

		schema.insert(
			name.clone(),
			CollectionInfo {
				name,
				key_path,
				key_strategy,
				indexes: Vec::new(),
			},
		);
	}

	let rows = conn
		.query_all(Statement::from_string(
			DbBackend::Sqlite,
			format!(
				"SELECT collection, name, key_path, is_unique, multi_entry \
				 FROM {INDEXES_TABLE} ORDER BY collection, name"
			),
		))
		.await?;

	for row in rows {
		let collection: String = row.try_get("", "collection")?;
		let key_path: String = row.try_get("", "key_path")?;
		let key_path: KeyPath = serde_json::from_str(&key_path)
			.map_err(|e| DbErr::Type(format!("invalid key path for index on {collection}: {e}")))?;

		let index = IndexSpec {
			name: row.try_get("", "name")?,
			key_path,
			unique: row.try_get::<i64>("", "is_unique")? != 0,
			multi_entry: row.try_get::<i64>("", "multi_entry")? != 0,
		};

		if let Some(info) = schema.get_mut(&collection) {
			info.indexes.push(index);
		}
	}

	Ok(schema)
}

fn key_column(strategy: KeyStrategy) -> &'static str {
	match strategy {
		KeyStrategy::Sequential => "record_key INTEGER PRIMARY KEY AUTOINCREMENT",
		// No declared type: the column keeps integers and strings as given
		KeyStrategy::Supplied => "record_key NOT NULL PRIMARY KEY",
	}
}

/// Creates the backing table of a collection under `table` (normally its own name)
pub(crate) async fn create_collection_table<C: ConnectionTrait>(
	conn: &C,
	table: &str,
	strategy: KeyStrategy,
) -> Result<(), DbErr> {
	conn.execute_unprepared(&format!(
		"CREATE TABLE IF NOT EXISTS {} ({}, body TEXT NOT NULL)",
		quote_ident(table),
		key_column(strategy),
	))
	.await?;
	Ok(())
}

pub(crate) async fn write_collection_meta<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	version: u32,
) -> Result<(), DbErr> {
	conn.execute(stmt(
		format!(
			r#"
			INSERT INTO {COLLECTIONS_TABLE} (name, key_path, key_strategy, created_version)
			VALUES (?, ?, ?, ?)
			ON CONFLICT (name) DO UPDATE SET
				key_path = excluded.key_path,
				key_strategy = excluded.key_strategy
			"#
		),
		vec![
			info.name.clone().into(),
			info.key_path.clone().into(),
			info.key_strategy.to_string().into(),
			i64::from(version).into(),
		],
	))
	.await?;
	Ok(())
}

/// Builds the SQL objects backing an index and records it in the metadata
///
/// Multi-entry side tables are backfilled from the records already present.
pub(crate) async fn create_index_objects<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	index: &IndexSpec,
) -> Result<(), TxError> {
	let unique = if index.unique { "UNIQUE " } else { "" };

	if index.multi_entry {
		let side = side_table_name(&info.name, &index.name);
		conn.execute_unprepared(&format!(
			"CREATE TABLE IF NOT EXISTS {} \
			 (value NOT NULL, record_key NOT NULL, PRIMARY KEY (value, record_key))",
			quote_ident(&side),
		))
		.await?;
		conn.execute_unprepared(&format!(
			"CREATE {unique}INDEX IF NOT EXISTS {} ON {} (value)",
			quote_ident(&format!("{side}__value")),
			quote_ident(&side),
		))
		.await?;
		conn.execute_unprepared(&format!(
			"CREATE INDEX IF NOT EXISTS {} ON {} (record_key)",
			quote_ident(&format!("{side}__key")),
			quote_ident(&side),
		))
		.await?;

		conn.execute_unprepared(&format!("DELETE FROM {}", quote_ident(&side)))
			.await?;
		for record in scan(conn, info).await? {
			write_multi_entry(conn, info, index, &record.key, &record.value).await?;
		}
	} else {
		conn.execute_unprepared(&format!(
			"CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({})",
			quote_ident(&sql_index_name(&info.name, &index.name)),
			quote_ident(&info.name),
			index.key_path.sql_expressions(None).join(", "),
		))
		.await
		.map_err(|e| map_write_err(&info.name, e))?;
	}

	let key_path = serde_json::to_string(&index.key_path).map_err(|e| DbErr::Type(e.to_string()))?;
	conn.execute(stmt(
		format!(
			r#"
			INSERT INTO {INDEXES_TABLE} (collection, name, key_path, is_unique, multi_entry)
			VALUES (?, ?, ?, ?, ?)
			ON CONFLICT (collection, name) DO UPDATE SET
				key_path = excluded.key_path,
				is_unique = excluded.is_unique,
				multi_entry = excluded.multi_entry
			"#
		),
		vec![
			info.name.clone().into(),
			index.name.clone().into(),
			key_path.into(),
			i64::from(index.unique).into(),
			i64::from(index.multi_entry).into(),
		],
	))
	.await?;

	Ok(())
}

pub(crate) fn map_write_err(collection: &str, err: DbErr) -> TxError {
	match err.sql_err() {
		Some(SqlErr::UniqueConstraintViolation(message)) => TxError::Constraint {
			collection: collection.to_string(),
			message,
		},
		_ => TxError::Database(err),
	}
}

pub(crate) fn decode_record(collection: &str, row: &QueryResult) -> Result<StoredRecord, TxError> {
	let key = RecordKey::from_row(row)?;
	let body: String = row.try_get("", "body")?;
	let value = serde_json::from_str(&body).map_err(|source| TxError::Corrupt {
		collection: collection.to_string(),
		key: key.clone(),
		source,
	})?;

	Ok(StoredRecord { key, value })
}

pub(crate) async fn get<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	key: &RecordKey,
) -> Result<Option<StoredRecord>, TxError> {
	let row = conn
		.query_one(stmt(
			format!(
				"SELECT {RECORD_COLUMNS} FROM {} WHERE record_key = ?",
				quote_ident(&info.name)
			),
			vec![key.to_sql()],
		))
		.await?;

	row.map(|row| decode_record(&info.name, &row)).transpose()
}

pub(crate) async fn scan<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
) -> Result<Vec<StoredRecord>, TxError> {
	let rows = conn
		.query_all(Statement::from_string(
			DbBackend::Sqlite,
			format!(
				"SELECT {RECORD_COLUMNS} FROM {} ORDER BY record_key",
				quote_ident(&info.name)
			),
		))
		.await?;

	rows.iter()
		.map(|row| decode_record(&info.name, row))
		.collect()
}

pub(crate) async fn count<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
) -> Result<u64, TxError> {
	let row = conn
		.query_one(Statement::from_string(
			DbBackend::Sqlite,
			format!("SELECT COUNT(*) AS n FROM {}", quote_ident(&info.name)),
		))
		.await?;

	Ok(match row {
		Some(row) => row.try_get::<i64>("", "n")?.max(0) as u64,
		None => 0,
	})
}

/// Resolves the key a record will be stored under
///
/// Sequential collections return `None` when the record carries no key yet.
pub(crate) fn record_key_for(
	info: &CollectionInfo,
	value: &Value,
) -> Result<Option<RecordKey>, TxError> {
	if !value.is_object() {
		return Err(TxError::NotAnObject {
			collection: info.name.clone(),
		});
	}

	let key = value_at_path(value, &info.key_path).map(|raw| {
		RecordKey::from_json(raw).ok_or_else(|| TxError::InvalidKey {
			collection: info.name.clone(),
			key_path: info.key_path.clone(),
		})
	});

	match (info.key_strategy, key.transpose()?) {
		(KeyStrategy::Supplied, None) => Err(TxError::MissingKey {
			collection: info.name.clone(),
			key_path: info.key_path.clone(),
		}),
		(KeyStrategy::Sequential, Some(RecordKey::Text(_))) => Err(TxError::InvalidKey {
			collection: info.name.clone(),
			key_path: info.key_path.clone(),
		}),
		(_, key) => Ok(key),
	}
}

/// Inserts or replaces a record, returning its key
pub(crate) async fn put<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	mut value: Value,
) -> Result<(RecordKey, Value), TxError> {
	let table = quote_ident(&info.name);

	let key = match record_key_for(info, &value)? {
		Some(key) => {
			conn.execute(stmt(
				format!(
					"INSERT INTO {table} (record_key, body) VALUES (?, ?) \
					 ON CONFLICT (record_key) DO UPDATE SET body = excluded.body"
				),
				vec![key.to_sql(), value.to_string().into()],
			))
			.await
			.map_err(|e| map_write_err(&info.name, e))?;
			key
		}
		None => {
			let result = conn
				.execute(stmt(
					format!("INSERT INTO {table} (record_key, body) VALUES (NULL, ?)"),
					vec![value.to_string().into()],
				))
				.await
				.map_err(|e| map_write_err(&info.name, e))?;

			let key = RecordKey::Int(result.last_insert_id() as i64);
			super::record::set_at_path(&mut value, &info.key_path, key.to_json());
			conn.execute(stmt(
				format!("UPDATE {table} SET body = ? WHERE record_key = ?"),
				vec![value.to_string().into(), key.to_sql()],
			))
			.await
			.map_err(|e| map_write_err(&info.name, e))?;
			key
		}
	};

	for index in info.multi_entry_indexes() {
		write_multi_entry(conn, info, index, &key, &value).await?;
	}

	Ok((key, value))
}

async fn write_multi_entry<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	index: &IndexSpec,
	key: &RecordKey,
	value: &Value,
) -> Result<(), TxError> {
	let side = quote_ident(&side_table_name(&info.name, &index.name));

	conn.execute(stmt(
		format!("DELETE FROM {side} WHERE record_key = ?"),
		vec![key.to_sql()],
	))
	.await?;

	let path = index.key_path.paths().into_iter().next().unwrap_or_default();
	for entry in multi_entry_values(value_at_path(value, path)) {
		conn.execute(stmt(
			format!("INSERT INTO {side} (value, record_key) VALUES (?, ?)"),
			vec![entry, key.to_sql()],
		))
		.await
		.map_err(|e| map_write_err(&info.name, e))?;
	}

	Ok(())
}

pub(crate) async fn delete<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	key: &RecordKey,
) -> Result<bool, TxError> {
	for index in info.multi_entry_indexes() {
		conn.execute(stmt(
			format!(
				"DELETE FROM {} WHERE record_key = ?",
				quote_ident(&side_table_name(&info.name, &index.name))
			),
			vec![key.to_sql()],
		))
		.await?;
	}

	let result = conn
		.execute(stmt(
			format!("DELETE FROM {} WHERE record_key = ?", quote_ident(&info.name)),
			vec![key.to_sql()],
		))
		.await?;

	Ok(result.rows_affected() > 0)
}

pub(crate) async fn clear<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
) -> Result<u64, TxError> {
	for index in info.multi_entry_indexes() {
		conn.execute_unprepared(&format!(
			"DELETE FROM {}",
			quote_ident(&side_table_name(&info.name, &index.name))
		))
		.await?;
	}

	let result = conn
		.execute_unprepared(&format!("DELETE FROM {}", quote_ident(&info.name)))
		.await?;

	Ok(result.rows_affected())
}

/// Looks records up through a secondary index
///
/// Compound indexes take a JSON array with one value per key path component.
/// Values that cannot be indexed (null, objects) match nothing.
pub(crate) async fn get_all_by_index<C: ConnectionTrait>(
	conn: &C,
	info: &CollectionInfo,
	index_name: &str,
	value: &Value,
) -> Result<Vec<StoredRecord>, TxError> {
	let index = info.index(index_name).ok_or_else(|| TxError::UnknownIndex {
		collection: info.name.clone(),
		index: index_name.to_string(),
	})?;
	let table = quote_ident(&info.name);

	let (condition, values) = if index.multi_entry {
		let Some(value) = json_to_sql(value) else {
			return Ok(Vec::new());
		};
		(
			format!(
				"record_key IN (SELECT record_key FROM {} WHERE value = ?)",
				quote_ident(&side_table_name(&info.name, &index.name))
			),
			vec![value],
		)
	} else {
		let components: Vec<&Value> = match (&index.key_path, value) {
			(KeyPath::Compound(paths), Value::Array(items)) if paths.len() == items.len() => {
				items.iter().collect()
			}
			(KeyPath::Compound(_), _) => return Ok(Vec::new()),
			(KeyPath::Single(_), value) => vec![value],
		};

		let mut values = Vec::with_capacity(components.len());
		for component in components {
			match json_to_sql(component) {
				Some(value) => values.push(value),
				None => return Ok(Vec::new()),
			}
		}

		let condition = index
			.key_path
			.sql_expressions(None)
			.into_iter()
			.map(|expr| format!("{expr} = ?"))
			.collect::<Vec<_>>()
			.join(" AND ");
		(condition, values)
	};

	let rows = conn
		.query_all(stmt(
			format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE {condition} ORDER BY record_key"),
			values,
		))
		.await?;

	rows.iter()
		.map(|row| decode_record(&info.name, row))
		.collect()
}

/// Names of every SQL index in the store
pub(crate) async fn sql_index_names<C: ConnectionTrait>(conn: &C) -> Result<Vec<String>, DbErr> {
	let rows = conn
		.query_all(Statement::from_string(
			DbBackend::Sqlite,
			"SELECT name FROM sqlite_master \
			 WHERE type = 'index' AND name NOT LIKE 'sqlite_%' ORDER BY name"
				.to_string(),
		))
		.await?;

	rows.iter().map(|row| row.try_get("", "name")).collect()
}
