//! Content-addressed blob storage: `save(bytes) -> uid`, `read(uid) -> bytes`,
//! `rm`/`rm_many`, enumeration. Two shapes are provided: a sharded
//! filesystem store (one regular file per blob) and a packed large-file
//! segment container. Both honour immutability: once a uid is minted,
//! it maps to exactly one byte string for its lifetime.

pub mod files_backend;
pub mod largefile_backend;

use std::sync::Arc;

use async_trait::async_trait;
use backym_util::config::{Config, DataBackendKind};
use backym_util::error::{Error, Result};

/// Contract implemented by every data backend shape.
#[async_trait]
pub trait DataBackend: Send + Sync {
	/// Store `data`, minting and returning a fresh, opaque uid. The uid
	/// is not derived from `data`'s content.
	async fn save(&self, data: &[u8]) -> Result<String>;

	/// Fetch the bytes previously stored under `uid`.
	async fn read(&self, uid: &str) -> Result<Vec<u8>>;

	/// Remove a single blob. Missing blobs are not an error.
	async fn rm(&self, uid: &str) -> Result<()>;

	/// Remove many blobs, returning those that could not be deleted
	/// (caller-visible faults, not including "already absent").
	async fn rm_many(&self, uids: &[String]) -> Result<Vec<String>> {
		let mut failed = Vec::new();
		for uid in uids {
			if self.rm(uid).await.is_err() {
				failed.push(uid.clone());
			}
		}
		Ok(failed)
	}

	/// Enumerate every uid currently stored, optionally filtered to
	/// those with a given textual prefix.
	async fn get_all_blob_uids(&self, prefix: Option<&str>) -> Result<Vec<String>>;

	/// Flush any buffered writers.
	async fn close(&self) -> Result<()> {
		Ok(())
	}
}

/// Mint a fresh, content-independent blob identifier: 16 random bytes,
/// hex-encoded to a 32-character token. Per the reference implementation
/// this specification distills, a uid is minted independently of the
/// bytes it ends up addressing; the checksum (not the uid) is the dedup
/// key (see `backym_meta`).
pub fn mint_uid() -> String {
	use rand::RngCore;
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

pub(crate) fn not_found(uid: &str) -> Error {
	Error::NotFound(uid.to_string())
}

/// Build the data backend selected by the configuration.
pub fn open(config: &Config) -> Result<Arc<dyn DataBackend>> {
	match config.data_backend {
		DataBackendKind::Files => Ok(Arc::new(files_backend::FilesBackend::new(
			config.data_dir.clone(),
		))),
		DataBackendKind::Largefile => Ok(Arc::new(largefile_backend::LargefileBackend::open(
			config.data_dir.clone(),
			config.block_size as u64,
			config.largefile_segment_size,
		)?)),
	}
}
