//! Configuration management

pub mod core_config;

pub use core_config::{ConfigError, CoreConfig, StoreConfig, SyncConfig, CONFIG_FILE};
