//! Entities owned by the meta backend: versions, blocks, refcounts, stats.
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
	pub uid: String,
	pub name: String,
	pub date: DateTime<Local>,
	/// Number of blocks, `ceil(size_bytes / block_size)`.
	pub size: u64,
	/// Exact logical length in bytes.
	pub size_bytes: u64,
	pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
	pub version_uid: String,
	pub id: u64,
	/// `None` marks a sparse (all-zero) block.
	pub uid: Option<String>,
	/// Hex content digest; `None` iff `uid` is `None`.
	pub checksum: Option<String>,
	/// Byte length of this block; equal to the version's block_size
	/// except possibly for the final block.
	pub size: u32,
	pub date: DateTime<Local>,
	pub valid: bool,
}

impl Block {
	pub fn is_sparse(&self) -> bool {
		self.uid.is_none()
	}

	/// A detached, owned copy safe to hand to a worker thread: it
	/// carries no reference into the meta session it was read from.
	pub fn deref(&self) -> Block {
		self.clone()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefCount {
	pub refs: u64,
	pub modified: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
	pub version_uid: String,
	pub date: DateTime<Local>,
	pub bytes_read: u64,
	pub blocks_read: u64,
	pub bytes_written: u64,
	pub blocks_written: u64,
	pub blocks_found_dedup: u64,
	pub bytes_found_dedup: u64,
	pub blocks_sparse: u64,
	pub bytes_sparse: u64,
	pub duration_seconds: u64,
}

impl Stats {
	pub fn new(version_uid: &str) -> Stats {
		Stats {
			version_uid: version_uid.to_string(),
			date: Local::now(),
			bytes_read: 0,
			blocks_read: 0,
			bytes_written: 0,
			blocks_written: 0,
			blocks_found_dedup: 0,
			bytes_found_dedup: 0,
			blocks_sparse: 0,
			bytes_sparse: 0,
			duration_seconds: 0,
		}
	}
}
