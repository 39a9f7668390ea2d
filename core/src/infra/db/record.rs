//! Records and keys as stored in a collection

use sea_orm::{DbErr, QueryResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Primary key of a record
///
/// Keys are either integers (sequential collections, legacy data) or strings
/// (caller-assigned identifiers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
	Int(i64),
	Text(String),
}

impl RecordKey {
	/// Reads a key out of a JSON value, accepting only integers and strings
	pub fn from_json(value: &Value) -> Option<Self> {
		match value {
			Value::String(text) => Some(Self::Text(text.clone())),
			Value::Number(number) => number.as_i64().map(Self::Int),
			_ => None,
		}
	}

	/// Key as the JSON value stored in the key path
	pub fn to_json(&self) -> Value {
		match self {
			Self::Int(value) => Value::from(*value),
			Self::Text(value) => Value::from(value.clone()),
		}
	}

	/// The key if it is a string
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Self::Text(value) => Some(value),
			Self::Int(_) => None,
		}
	}

	pub(crate) fn to_sql(&self) -> sea_orm::Value {
		match self {
			Self::Int(value) => (*value).into(),
			Self::Text(value) => value.clone().into(),
		}
	}

	/// Decodes a key selected as `typeof(record_key) AS key_type` and
	/// `CAST(record_key AS TEXT) AS key_text`
	pub(crate) fn from_row(row: &QueryResult) -> Result<Self, DbErr> {
		let key_type: String = row.try_get("", "key_type")?;
		let key_text: String = row.try_get("", "key_text")?;

		if key_type == "integer" {
			key_text
				.parse::<i64>()
				.map(Self::Int)
				.map_err(|e| DbErr::Type(format!("invalid integer key '{key_text}': {e}")))
		} else {
			Ok(Self::Text(key_text))
		}
	}
}

impl fmt::Display for RecordKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Int(value) => write!(f, "{value}"),
			Self::Text(value) => f.write_str(value),
		}
	}
}

impl From<&str> for RecordKey {
	fn from(value: &str) -> Self {
		Self::Text(value.to_string())
	}
}

impl From<String> for RecordKey {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl From<i64> for RecordKey {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

/// A record read back from a collection
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
	pub key: RecordKey,
	pub value: Value,
}

impl StoredRecord {
	/// Value at a dotted path inside the record
	pub fn field(&self, path: &str) -> Option<&Value> {
		value_at_path(&self.value, path)
	}
}

/// Columns every record query selects
pub(crate) const RECORD_COLUMNS: &str =
	"typeof(record_key) AS key_type, CAST(record_key AS TEXT) AS key_text, body";

pub(crate) fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
	path.split('.')
		.try_fold(value, |current, segment| current.as_object()?.get(segment))
		.filter(|found| !found.is_null())
}

/// Writes `new` at `path`, creating intermediate objects as needed
pub(crate) fn set_at_path(value: &mut Value, path: &str, new: Value) -> bool {
	let mut segments = path.split('.').peekable();
	let mut current = value;

	while let Some(segment) = segments.next() {
		let Some(object) = current.as_object_mut() else {
			return false;
		};

		if segments.peek().is_none() {
			object.insert(segment.to_string(), new);
			return true;
		}

		current = object
			.entry(segment.to_string())
			.or_insert_with(|| Value::Object(Map::new()));
	}

	false
}

/// Maps a scalar JSON value onto the SQL value `json_extract` would produce
///
/// Returns `None` for null, arrays and objects which are not indexable.
/// Integral floats map to integers since SQLite compares `1` and `1.0` equal.
pub(crate) fn json_to_sql(value: &Value) -> Option<sea_orm::Value> {
	match value {
		Value::String(text) => Some(text.clone().into()),
		Value::Bool(flag) => Some(i64::from(*flag).into()),
		Value::Number(number) => match (number.as_i64(), number.as_f64()) {
			(Some(int), _) => Some(int.into()),
			(None, Some(float)) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
				Some((float as i64).into())
			}
			(None, float) => float.map(Into::into),
		},
		Value::Null | Value::Array(_) | Value::Object(_) => None,
	}
}

/// Distinct SQL values for a multi-entry index
///
/// Values are compared after mapping, so `1`, `1.0` and `true` collapse into
/// one entry just as they would in the side table's primary key.
pub(crate) fn multi_entry_values(value: Option<&Value>) -> Vec<sea_orm::Value> {
	let candidates: Vec<sea_orm::Value> = match value {
		Some(Value::Array(items)) => items.iter().filter_map(json_to_sql).collect(),
		Some(scalar) => json_to_sql(scalar).into_iter().collect(),
		None => Vec::new(),
	};

	let mut values: Vec<sea_orm::Value> = Vec::with_capacity(candidates.len());
	for candidate in candidates {
		if !values.contains(&candidate) {
			values.push(candidate);
		}
	}
	values
}
