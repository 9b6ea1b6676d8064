//! Pipelined writer over a `file://` target.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use backym_util::error::Error;

use crate::{parse_file_url, BlockRef};

/// A `file://` target opened for writing: a regular file or an
/// already-existing block device node, sized to `size_bytes`.
pub struct Target {
	file: Arc<File>,
	block_size: u64,
}

impl Target {
	/// `force` permits reusing/truncating a target that already
	/// exists as a regular file; without it, an existing regular file
	/// is refused. An existing block device is always accepted and
	/// never resized.
	pub fn open_w(url: &str, block_size: u64, size_bytes: u64, force: bool) -> Result<Self, Error> {
		let path = parse_file_url(url)?;

		let existing = std::fs::symlink_metadata(&path).ok();
		let is_device = existing
			.as_ref()
			.map(|m| !m.file_type().is_file())
			.unwrap_or(false);
		if let Some(m) = &existing {
			if m.file_type().is_file() && !force {
				return Err(Error::Message(format!(
					"target {} already exists, pass force to overwrite",
					path.display()
				)));
			}
		}

		let file = OpenOptions::new()
			.write(true)
			.create(!is_device)
			.truncate(false)
			.open(&path)?;
		if !is_device {
			file.set_len(size_bytes)?;
		}
		tracing::debug!(path = %path.display(), size_bytes, is_device, "opened target");

		Ok(Self {
			file: Arc::new(file),
			block_size,
		})
	}

	/// Write one block's bytes at its aligned offset.
	pub async fn write(&self, block_ref: BlockRef, data: Vec<u8>) -> Result<(), Error> {
		let offset = block_ref * self.block_size;
		let file = self.file.clone();
		tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
			.await
			.map_err(|e| Error::PipelineBroken(e.to_string()))??;
		Ok(())
	}

	/// Drain and fsync.
	pub async fn close(&self) -> Result<(), Error> {
		let file = self.file.clone();
		tokio::task::spawn_blocking(move || file.sync_all())
			.await
			.map_err(|e| Error::PipelineBroken(e.to_string()))??;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn writes_land_at_aligned_offsets() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let path = tmp.to_path_buf().join("restored.img");
		let url = format!("file://{}", path.to_str().unwrap());

		let target = Target::open_w(&url, 4, 12, false).unwrap();
		target.write(0, vec![1u8; 4]).await.unwrap();
		target.write(2, vec![3u8; 4]).await.unwrap();
		target.write(1, vec![2u8; 4]).await.unwrap();
		target.close().await.unwrap();

		let written = std::fs::read(&path).unwrap();
		assert_eq!(written, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
	}

	#[tokio::test]
	async fn refuses_to_overwrite_an_existing_regular_file_without_force() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let path = tmp.to_path_buf().join("restored.img");
		std::fs::write(&path, b"pre-existing").unwrap();
		let url = format!("file://{}", path.to_str().unwrap());

		assert!(Target::open_w(&url, 4, 12, false).is_err());
		assert!(Target::open_w(&url, 4, 12, true).is_ok());
	}
}
