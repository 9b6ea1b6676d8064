//! Types and functions for loading the backym configuration file.
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Embedded metadata storage engine.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetaEngine {
	Sqlite,
	Lmdb,
	Sled,
}

impl Default for MetaEngine {
	fn default() -> Self {
		MetaEngine::Sqlite
	}
}

/// Shape of the content-addressed blob store.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataBackendKind {
	Files,
	Largefile,
}

impl Default for DataBackendKind {
	fn default() -> Self {
		DataBackendKind::Files
	}
}

/// Represents the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Root of the content-addressed blob store (sharded files, or
	/// the large-file segment container)
	pub data_dir: PathBuf,

	/// Directory holding the embedded key/value engine's files
	pub meta_dir: PathBuf,

	/// Directory holding advisory lock files
	pub lock_dir: PathBuf,

	/// Size of the fixed blocks a version is split into
	#[serde(default = "default_block_size")]
	pub block_size: usize,

	/// Hash function identifier. Fixed to sha512 in this release; kept
	/// for forward compatibility
	#[serde(default = "default_hash")]
	pub hash: String,

	/// Embedded engine backing the meta backend
	#[serde(default)]
	pub meta_engine: MetaEngine,

	/// Shape of the data backend
	#[serde(default)]
	pub data_backend: DataBackendKind,

	/// Segment size for the large-file data backend, only consulted
	/// when data_backend = "largefile"
	#[serde(default = "default_largefile_segment_size")]
	pub largefile_segment_size: u64,

	/// Minimum age, in seconds, a zero-refcount blob must reach before
	/// cleanup_fast may delete it
	#[serde(default = "default_cleanup_fast_grace_seconds")]
	pub cleanup_fast_grace_seconds: u64,

	/// Identity this process registers with the locking service, used
	/// for peer detection during cleanup_full. Defaults to
	/// hostname:pid
	#[serde(default = "default_process_name")]
	pub process_name: String,
}

fn default_block_size() -> usize {
	4 * 1024 * 1024
}

fn default_hash() -> String {
	"sha512".to_string()
}

fn default_largefile_segment_size() -> u64 {
	4 * 1024 * 1024 * 1024
}

fn default_cleanup_fast_grace_seconds() -> u64 {
	3600
}

fn default_process_name() -> String {
	format!("{}:{}", hostname_or_unknown(), std::process::id())
}

fn hostname_or_unknown() -> String {
	hostname::get()
		.ok()
		.and_then(|s| s.into_string().ok())
		.unwrap_or_else(|| "unknown-host".to_string())
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn minimal_config_takes_defaults() {
		let toml = r#"
			data_dir = "/tmp/backym/data"
			meta_dir = "/tmp/backym/meta"
			lock_dir = "/tmp/backym/lock"
		"#;
		let config: Config = toml::from_str(toml).unwrap();
		assert_eq!(config.block_size, 4 * 1024 * 1024);
		assert_eq!(config.hash, "sha512");
		assert_eq!(config.meta_engine, MetaEngine::Sqlite);
		assert_eq!(config.data_backend, DataBackendKind::Files);
		assert_eq!(config.cleanup_fast_grace_seconds, 3600);
	}

	#[test]
	fn full_config_round_trips() {
		let toml = r#"
			data_dir = "/data"
			meta_dir = "/meta"
			lock_dir = "/lock"
			block_size = 1048576
			meta_engine = "lmdb"
			data_backend = "largefile"
			largefile_segment_size = 1073741824
			cleanup_fast_grace_seconds = 60
			process_name = "node-a:1234"
		"#;
		let config: Config = toml::from_str(toml).unwrap();
		assert_eq!(config.block_size, 1048576);
		assert_eq!(config.meta_engine, MetaEngine::Lmdb);
		assert_eq!(config.data_backend, DataBackendKind::Largefile);
		assert_eq!(config.largefile_segment_size, 1073741824);
		assert_eq!(config.process_name, "node-a:1234");
	}
}
