//! Core configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Name of the configuration file inside the data directory
pub const CONFIG_FILE: &str = "tether.json";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
	#[error("{field} must be greater than zero")]
	Zero { field: &'static str },

	#[error("baseDelayMs ({base}) must not exceed maxDelayMs ({max})")]
	DelayRange { base: u64, max: u64 },

	#[error("requestTimeoutMs ({request}) must be below inFlightTimeoutMs ({in_flight})")]
	TimeoutOrder { request: u64, in_flight: u64 },

	#[error("jitterRatio must be in [0, 1), got {0}")]
	JitterRatio(f64),

	#[error("config version {found} is newer than supported version {supported}")]
	UnsupportedVersion { found: u32, supported: u32 },
}

/// Local store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
	/// Directory holding one `<name>.db` file per store
	pub data_dir: PathBuf,

	#[serde(default = "StoreConfig::default_max_connections")]
	pub max_connections: u32,

	/// How long an upgrading open waits for older handles to close
	#[serde(default = "StoreConfig::default_blocked_timeout_ms")]
	pub blocked_timeout_ms: u64,
}

impl StoreConfig {
	fn default_max_connections() -> u32 {
		4
	}

	fn default_blocked_timeout_ms() -> u64 {
		5_000
	}

	/// Defaults rooted at `data_dir`
	pub fn new(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			data_dir: data_dir.into(),
			max_connections: Self::default_max_connections(),
			blocked_timeout_ms: Self::default_blocked_timeout_ms(),
		}
	}
}

/// Retry, backoff and scheduling settings for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
	/// Attempts before a transiently failing entry is abandoned
	pub max_retries: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	/// In-flight entries older than this are treated as crashed
	pub in_flight_timeout_ms: u64,
	pub request_timeout_ms: u64,
	pub batch_size: usize,
	/// Entries for different records replayed concurrently
	pub workers: usize,
	/// Fraction of the backoff delay randomly shaved off
	pub jitter_ratio: f64,
	/// Period of the safety-net cycle while online
	pub safety_interval_ms: u64,
	/// How long succeeded entries are kept; `None` keeps them forever
	pub succeeded_retention_ms: Option<u64>,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			max_retries: 5,
			base_delay_ms: 1_000,
			max_delay_ms: 60_000,
			in_flight_timeout_ms: 120_000,
			request_timeout_ms: 30_000,
			batch_size: 25,
			workers: 4,
			jitter_ratio: 0.2,
			safety_interval_ms: 300_000,
			succeeded_retention_ms: Some(7 * 24 * 60 * 60 * 1_000),
		}
	}
}

impl SyncConfig {
	/// Rejects settings the engine cannot run with
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (field, value) in [
			("maxRetries", self.max_retries as u64),
			("batchSize", self.batch_size as u64),
			("workers", self.workers as u64),
			("requestTimeoutMs", self.request_timeout_ms),
			("safetyIntervalMs", self.safety_interval_ms),
		] {
			if value == 0 {
				return Err(ConfigError::Zero { field });
			}
		}

		if self.base_delay_ms > self.max_delay_ms {
			return Err(ConfigError::DelayRange {
				base: self.base_delay_ms,
				max: self.max_delay_ms,
			});
		}

		// A request still running must never look abandoned to the stale sweep
		if self.request_timeout_ms >= self.in_flight_timeout_ms {
			return Err(ConfigError::TimeoutOrder {
				request: self.request_timeout_ms,
				in_flight: self.in_flight_timeout_ms,
			});
		}

		if !(0.0..1.0).contains(&self.jitter_ratio) {
			return Err(ConfigError::JitterRatio(self.jitter_ratio));
		}

		Ok(())
	}

	/// Deadline for a single remote request
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	/// Period of the safety cycle that runs while online
	pub fn safety_interval(&self) -> Duration {
		Duration::from_millis(self.safety_interval_ms)
	}
}

/// Top-level configuration persisted as `tether.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
	/// Config schema version
	pub version: u32,

	/// Directory the config file lives in
	#[serde(skip)]
	pub data_dir: PathBuf,

	pub log_level: String,

	pub store: StoreConfig,

	#[serde(default)]
	pub sync: SyncConfig,
}

impl CoreConfig {
	/// Newest `tether.json` format this build understands
	pub fn target_version() -> u32 {
		1
	}

	/// Loads `tether.json` from `data_dir`, creating it with defaults when missing
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = data_dir.join(CONFIG_FILE);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let mut config: CoreConfig = serde_json::from_str(&json)?;
			config.data_dir = data_dir.to_path_buf();

			if config.version > Self::target_version() {
				return Err(anyhow!(ConfigError::UnsupportedVersion {
					found: config.version,
					supported: Self::target_version(),
				}));
			}
			config.validate()?;
			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	/// Default configuration for a fresh data directory
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			store: StoreConfig::new(data_dir.join("stores")),
			data_dir,
			log_level: "info".to_string(),
			sync: SyncConfig::default(),
		}
	}

	/// Writes the configuration back to `tether.json`
	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	/// Checks the sync and store sections
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.store.max_connections == 0 {
			return Err(ConfigError::Zero {
				field: "maxConnections",
			});
		}
		self.sync.validate()
	}

	/// Directory the rolling log file is written to
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}
