//! Collection and index declarations
//!
//! A collection is backed by one SQLite table holding `(record_key, body)` pairs where
//! `body` is the JSON record. Secondary indexes are expression indexes over
//! `json_extract(body, ...)`, except multi-entry indexes which are kept in a
//! side table with one row per array element.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Table holding one row per declared collection
pub(crate) const COLLECTIONS_TABLE: &str = "__tether_collections";

/// Table holding one row per declared secondary index
pub(crate) const INDEXES_TABLE: &str = "__tether_indexes";

/// How a collection obtains the primary key of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
	/// The caller puts the key in the record at the collection's key path
	Supplied,
	/// The store assigns ascending integer keys and writes them into the key path
	Sequential,
}

/// Dotted path into a JSON record, or several of them for compound indexes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
	Single(String),
	Compound(Vec<String>),
}

impl KeyPath {
	/// Path to one field
	pub fn single(path: impl Into<String>) -> Self {
		Self::Single(path.into())
	}

	/// Key made of several fields, compared in order
	pub fn compound<I, S>(paths: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self::Compound(paths.into_iter().map(Into::into).collect())
	}

	/// Dotted paths making up the key
	pub fn paths(&self) -> Vec<&str> {
		match self {
			Self::Single(path) => vec![path.as_str()],
			Self::Compound(paths) => paths.iter().map(String::as_str).collect(),
		}
	}

	/// Whether the key has more than one part
	pub fn is_compound(&self) -> bool {
		matches!(self, Self::Compound(_))
	}

	/// SQL expressions extracting every component of this path from `body`
	pub(crate) fn sql_expressions(&self, table_alias: Option<&str>) -> Vec<String> {
		self.paths()
			.into_iter()
			.map(|path| json_extract(table_alias, path))
			.collect()
	}
}

/// Declaration of a secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
	pub name: String,
	pub key_path: KeyPath,
	pub unique: bool,
	pub multi_entry: bool,
}

impl IndexSpec {
	/// Non-unique, single-entry index
	pub fn new(name: impl Into<String>, key_path: KeyPath) -> Self {
		Self {
			name: name.into(),
			key_path,
			unique: false,
			multi_entry: false,
		}
	}

	/// Index over a single field named like the index itself
	pub fn on_field(name: impl Into<String>) -> Self {
		let name = name.into();
		Self::new(name.clone(), KeyPath::Single(name))
	}

	/// Rejects two records with the same index value
	pub fn unique(mut self) -> Self {
		self.unique = true;
		self
	}

	/// Indexes every element of an array value separately
	pub fn multi_entry(mut self) -> Self {
		self.multi_entry = true;
		self
	}

	pub(crate) fn validate(&self, collection: &str) -> Result<(), SchemaError> {
		validate_name(&self.name)?;
		if self.multi_entry && self.key_path.is_compound() {
			return Err(SchemaError::CompoundMultiEntry {
				collection: collection.to_string(),
				index: self.name.clone(),
			});
		}
		for path in self.key_path.paths() {
			validate_path(path)?;
		}
		Ok(())
	}
}

/// Declaration of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
	pub name: String,
	pub key_path: String,
	pub key_strategy: KeyStrategy,
	pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
	/// Collection whose records carry their own key at `key_path`
	pub fn supplied(name: impl Into<String>, key_path: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			key_path: key_path.into(),
			key_strategy: KeyStrategy::Supplied,
			indexes: Vec::new(),
		}
	}

	/// Collection whose keys are assigned by the store
	pub fn sequential(name: impl Into<String>, key_path: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			key_path: key_path.into(),
			key_strategy: KeyStrategy::Sequential,
			indexes: Vec::new(),
		}
	}

	/// Adds an index created with the collection
	pub fn index(mut self, index: IndexSpec) -> Self {
		self.indexes.push(index);
		self
	}

	pub(crate) fn validate(&self) -> Result<(), SchemaError> {
		validate_name(&self.name)?;
		validate_path(&self.key_path)?;
		for index in &self.indexes {
			index.validate(&self.name)?;
		}
		Ok(())
	}
}

/// Schema of a collection as recorded in the store metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
	pub name: String,
	pub key_path: String,
	pub key_strategy: KeyStrategy,
	pub indexes: Vec<IndexSpec>,
}

impl CollectionInfo {
	/// Index by name
	pub fn index(&self, name: &str) -> Option<&IndexSpec> {
		self.indexes.iter().find(|index| index.name == name)
	}

	pub(crate) fn multi_entry_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
		self.indexes.iter().filter(|index| index.multi_entry)
	}
}

impl From<CollectionSpec> for CollectionInfo {
	fn from(spec: CollectionSpec) -> Self {
		Self {
			name: spec.name,
			key_path: spec.key_path,
			key_strategy: spec.key_strategy,
			indexes: spec.indexes,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
	#[error("invalid name '{0}': use ASCII letters, digits and '_', starting with a letter")]
	InvalidName(String),

	#[error("invalid key path '{0}'")]
	InvalidPath(String),

	#[error("index {index} on {collection} cannot be both compound and multi-entry")]
	CompoundMultiEntry { collection: String, index: String },
}

/// Names end up as SQL identifiers, so only a conservative charset is accepted
pub(crate) fn validate_name(name: &str) -> Result<(), SchemaError> {
	let mut chars = name.chars();
	let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& !name.contains("__");

	if valid {
		Ok(())
	} else {
		Err(SchemaError::InvalidName(name.to_string()))
	}
}

pub(crate) fn validate_path(path: &str) -> Result<(), SchemaError> {
	let valid = !path.is_empty()
		&& path.split('.').all(|segment| {
			!segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		});

	if valid {
		Ok(())
	} else {
		Err(SchemaError::InvalidPath(path.to_string()))
	}
}

pub(crate) fn quote_ident(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn json_extract(table_alias: Option<&str>, path: &str) -> String {
	match table_alias {
		Some(alias) => format!("json_extract({alias}.body, '$.{path}')"),
		None => format!("json_extract(body, '$.{path}')"),
	}
}

pub(crate) fn sql_index_name(collection: &str, index: &str) -> String {
	format!("{collection}__ix_{index}")
}

pub(crate) fn side_table_name(collection: &str, index: &str) -> String {
	format!("{collection}__mx_{index}")
}
