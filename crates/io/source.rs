//! Pipelined reader over a `file://` source.
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use tokio::sync::mpsc;

use backym_util::background::BackgroundRunner;
use backym_util::data::hash_block;
use backym_util::error::Error;

use crate::{block_len, parse_file_url, BlockRef, Completion};

/// A `file://` source opened for reading. Reads are enqueued and may
/// complete out of order; `get()` dequeues whichever finished first.
pub struct Source {
	file: Arc<File>,
	block_size: u64,
	size_bytes: u64,
	workers: Arc<BackgroundRunner>,
	completions_tx: mpsc::UnboundedSender<Result<Completion, Error>>,
	completions_rx: mpsc::UnboundedReceiver<Result<Completion, Error>>,
	in_flight: usize,
}

impl Source {
	pub fn open(url: &str, block_size: u64, workers: Arc<BackgroundRunner>) -> Result<Self, Error> {
		let path = parse_file_url(url)?;
		let file = File::open(&path)?;
		let size_bytes = file.metadata()?.len();
		tracing::debug!(path = %path.display(), size_bytes, "opened source");
		let (completions_tx, completions_rx) = mpsc::unbounded_channel();
		Ok(Self {
			file: Arc::new(file),
			block_size,
			size_bytes,
			workers,
			completions_tx,
			completions_rx,
			in_flight: 0,
		})
	}

	pub fn size(&self) -> u64 {
		self.size_bytes
	}

	/// Enqueue a read. The background worker pool computes the
	/// checksum as soon as the bytes are in hand.
	pub fn read(&mut self, block_ref: BlockRef) {
		tracing::trace!(block_ref, "enqueue read");
		let file = self.file.clone();
		let block_size = self.block_size;
		let size_bytes = self.size_bytes;
		let tx = self.completions_tx.clone();
		self.in_flight += 1;
		self.workers.spawn(async move {
			let result = read_one(file, block_size, size_bytes, block_ref).await;
			let _ = tx.send(result);
			Ok(())
		});
	}

	/// Dequeue the next finished read, in whatever order it completed.
	pub async fn get(&mut self) -> Result<Completion, Error> {
		match self.completions_rx.recv().await {
			Some(result) => {
				self.in_flight -= 1;
				result
			}
			None => Err(Error::PipelineBroken("reader pool shut down".into())),
		}
	}

	/// Number of reads dispatched but not yet collected via `get()`.
	pub fn in_flight(&self) -> usize {
		self.in_flight
	}

	/// Synchronous read used by the scrub path: no pooling, no
	/// background hop, result available immediately.
	pub fn read_sync(&self, block_ref: BlockRef) -> Result<Completion, Error> {
		let offset = block_ref * self.block_size;
		let len = block_len(offset, self.block_size, self.size_bytes);
		let mut buf = vec![0u8; len as usize];
		if len > 0 {
			self.file.read_exact_at(&mut buf, offset)?;
		}
		let checksum = hash_block(&buf);
		Ok((block_ref, buf, checksum))
	}

	/// Drain: wait for every dispatched read to complete. Callers that
	/// do not want the data can discard the completions; what matters
	/// is that dispatched and completed counts end up equal.
	pub async fn close(&mut self) -> Result<(), Error> {
		while self.in_flight > 0 {
			self.get().await?;
		}
		Ok(())
	}
}

async fn read_one(
	file: Arc<File>,
	block_size: u64,
	size_bytes: u64,
	block_ref: BlockRef,
) -> Result<Completion, Error> {
	let offset = block_ref * block_size;
	let len = block_len(offset, block_size, size_bytes);
	let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
		let mut buf = vec![0u8; len as usize];
		if len > 0 {
			file.read_exact_at(&mut buf, offset)?;
		}
		Ok(buf)
	})
	.await
	.map_err(|e| Error::PipelineBroken(e.to_string()))??;
	let checksum = hash_block(&data);
	Ok((block_ref, data, checksum))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tokio::sync::watch;

	fn spawn_pool() -> Arc<BackgroundRunner> {
		let (_tx, rx) = watch::channel(false);
		let (runner, _join) = BackgroundRunner::new(2, rx);
		runner
	}

	#[tokio::test]
	async fn reads_come_back_tagged_with_their_block_ref() {
		let f = mktemp::Temp::new_file().unwrap();
		let path = f.to_path_buf();
		{
			let mut handle = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
			handle.write_all(&[1u8; 4].repeat(3)).unwrap(); // 12 bytes, block_size 4
		}
		let url = format!("file://{}", path.to_str().unwrap());
		let workers = spawn_pool();
		let mut source = Source::open(&url, 4, workers).unwrap();
		assert_eq!(source.size(), 12);

		source.read(0);
		source.read(1);
		source.read(2);

		let mut seen = std::collections::HashSet::new();
		for _ in 0..3 {
			let (block_ref, data, checksum) = source.get().await.unwrap();
			assert_eq!(data.len(), 4);
			assert_eq!(checksum, hash_block(&data));
			seen.insert(block_ref);
		}
		assert_eq!(seen, [0, 1, 2].into_iter().collect());
	}

	#[tokio::test]
	async fn final_block_is_short_when_size_is_not_block_aligned() {
		let f = mktemp::Temp::new_file().unwrap();
		let path = f.to_path_buf();
		{
			let mut handle = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
			handle.write_all(&[7u8; 10]).unwrap();
		}
		let url = format!("file://{}", path.to_str().unwrap());
		let workers = spawn_pool();
		let source = Source::open(&url, 4, workers).unwrap();
		let (_, data, _) = source.read_sync(2).unwrap();
		assert_eq!(data.len(), 2);
	}
}
