//! Local durable store
//!
//! A store is a SQLite file holding named collections of JSON records. Its
//! schema is described by a [`SchemaCatalog`] of versioned migration steps,
//! applied by the [`MigrationEngine`] when a [`StoreManager`] opens the store
//! at a newer version than the one on disk.

pub mod catalog;
pub mod event;
pub mod migration;
pub mod migrator;
pub mod record;
pub mod schema;
pub mod scope;
pub mod store;
pub(crate) mod table;

pub use catalog::{CatalogError, MigrationStep, RecordMigration, SchemaCatalog, SchemaOp};
pub use event::{StoreEvent, StoreEventBus, VersionChangeRequest};
pub use migrator::{read_version, MigrationEngine, MigrationError, StepError};
pub use record::{RecordKey, StoredRecord};
pub use schema::{CollectionInfo, CollectionSpec, IndexSpec, KeyPath, KeyStrategy, SchemaError};
pub use scope::{AtomicScope, TxError, TxMode};
pub use store::{OpenError, StoreHandle, StoreManager};
