//! Orchestrates backup, restore, scrub, `rm` and garbage collection,
//! wiring the meta backend, data backend, IO source and lock manager
//! together. The engine's own thread is sequential; it owns no
//! internal concurrency beyond the IO source's read/hash worker pool.

pub mod hints;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::IteratorRandom;
use tokio::sync::watch;

use backym_data::DataBackend;
use backym_io::{Source, Target};
use backym_lock::{peers, LockManager, CLEANUP_FAST_LOCK, GLOBAL_LOCK};
use backym_meta::{Block, MetaBackend, Stats, Version};
use backym_util::background::BackgroundRunner;
use backym_util::config::Config;
use backym_util::data::hash_block;
use backym_util::error::{Error, Result};

pub use hints::{blocks_from_hints, parse_hints, Hint};

pub struct Engine {
	meta: MetaBackend,
	data: Arc<dyn DataBackend>,
	lock: LockManager,
	block_size: u64,
	workers: Arc<BackgroundRunner>,
	_registration: peers::ProcessRegistration,
	_stop_workers: watch::Sender<bool>,
	_worker_join: tokio::task::JoinHandle<()>,
}

fn ceil_div(a: u64, b: u64) -> u64 {
	(a + b - 1) / b
}

/// Exact byte length of block `id` out of `size` blocks covering
/// `size_bytes` logical bytes.
fn exact_block_len(id: u64, size: u64, size_bytes: u64, block_size: u64) -> u32 {
	if id + 1 == size {
		(size_bytes - (size - 1) * block_size) as u32
	} else {
		block_size as u32
	}
}

impl Engine {
	/// Must be called from within a running tokio runtime: it spawns
	/// the IO source's background worker pool.
	pub fn new(config: &Config) -> Result<Self> {
		let meta = backym_meta::open(config)?;
		let data = backym_data::open(config)?;
		let lock = LockManager::new(config.lock_dir.clone(), config.process_name.clone())?;
		let registration = peers::ProcessRegistration::register(&config.lock_dir, &config.process_name)?;

		// Liveness check: fail fast if another instance holds the
		// global lock right now.
		match lock.acquire(GLOBAL_LOCK)? {
			Some(guard) => drop(guard),
			None => return Err(Error::Locked(GLOBAL_LOCK.to_string())),
		}

		let (stop_tx, stop_rx) = watch::channel(false);
		let (workers, worker_join) = BackgroundRunner::new(4, stop_rx);

		Ok(Self {
			meta,
			data,
			lock,
			block_size: config.block_size as u64,
			workers,
			_registration: registration,
			_stop_workers: stop_tx,
			_worker_join: worker_join,
		})
	}

	pub fn prepare_version(&self, name: &str, size_bytes: u64, from_version_uid: Option<&str>) -> Result<String> {
		let base_blocks = match from_version_uid {
			Some(uid) => {
				let base = self
					.meta
					.get_version(uid)?
					.ok_or_else(|| Error::InvalidBase(uid.to_string()))?;
				if !base.valid {
					return Err(Error::InvalidBase(uid.to_string()));
				}
				Some(self.meta.get_blocks(uid)?)
			}
			None => None,
		};
		let by_id: HashMap<u64, Block> = base_blocks
			.map(|blocks| blocks.into_iter().map(|b| (b.id, b)).collect())
			.unwrap_or_default();

		let size = ceil_div(size_bytes, self.block_size);
		let version = self.meta.set_version(name, size, size_bytes, false)?;

		match self.lock.lock(&version.uid) {
			Ok(true) => {
				self.lock.unlock(&version.uid)?;
			}
			Ok(false) => return Err(Error::Locked(version.uid)),
			Err(e) => return Err(e),
		}

		for id in 0..size {
			let exact_size = exact_block_len(id, size, size_bytes, self.block_size);
			match by_id.get(&id) {
				Some(base) if base.size == exact_size => {
					self.meta.set_block(
						&version.uid,
						id,
						base.uid.as_deref(),
						base.checksum.as_deref(),
						base.size,
						base.valid,
						false,
					)?;
				}
				_ => {
					// No base block at this id, or the base's final
					// block had a different length: the new block is
					// definitionally different content, so it starts
					// sparse-valid.
					self.meta.set_block(&version.uid, id, None, None, exact_size, true, false)?;
				}
			}
		}

		Ok(version.uid)
	}

	pub async fn backup(
		&self,
		name: &str,
		source_url: &str,
		hints: Option<Vec<Hint>>,
		from_version: Option<&str>,
	) -> Result<String> {
		let mut source = Source::open(source_url, self.block_size, self.workers.clone())?;
		let source_size = source.size();

		if let Some(hints) = &hints {
			for h in hints {
				let end = h
					.offset
					.checked_add(h.length)
					.ok_or_else(|| Error::InvalidHints(format!("hint offset {} + length {} overflows", h.offset, h.length)))?;
				if end > source_size {
					return Err(Error::InvalidHints(format!(
						"hint [{}, {}) exceeds source size {}",
						h.offset, end, source_size
					)));
				}
			}
		}

		let total_blocks = ceil_div(source_size, self.block_size);
		let (read_blocks, sparse_blocks): (HashSet<u64>, HashSet<u64>) = match &hints {
			Some(hints) => (
				blocks_from_hints(hints.iter().filter(|h| h.exists), self.block_size),
				blocks_from_hints(hints.iter().filter(|h| !h.exists), self.block_size),
			),
			None => ((0..total_blocks).collect(), HashSet::new()),
		};

		let version_uid = self.prepare_version(name, source_size, from_version)?;
		let guard = self
			.lock
			.acquire(&version_uid)?
			.ok_or_else(|| Error::Locked(version_uid.clone()))?;

		let result = self
			.run_backup(&version_uid, &mut source, &read_blocks, &sparse_blocks, hints.is_some(), from_version)
			.await;

		drop(guard);
		source.close().await.ok();

		result.map(|()| version_uid)
	}

	async fn run_backup(
		&self,
		version_uid: &str,
		source: &mut Source,
		read_blocks: &HashSet<u64>,
		sparse_blocks: &HashSet<u64>,
		has_hints: bool,
		from_version: Option<&str>,
	) -> Result<()> {
		if has_hints && from_version.is_some() {
			if let Err(e) = self.hint_sanity_check(version_uid, read_blocks, sparse_blocks, source) {
				self.meta.rm_version(version_uid).ok();
				return Err(e);
			}
		}

		let size = self
			.meta
			.get_version(version_uid)?
			.ok_or_else(|| Error::Message(format!("version {} vanished during backup", version_uid)))?
			.size;

		let mut dispatched = 0u64;
		for id in 0..size {
			let existing = self
				.meta
				.get_block(version_uid, id)?
				.ok_or_else(|| Error::Message(format!("missing block row {} for version {}", id, version_uid)))?;
			if read_blocks.contains(&id) || !existing.valid {
				source.read(id);
				dispatched += 1;
			} else if sparse_blocks.contains(&id) {
				self.meta
					.set_block(version_uid, id, None, None, existing.size, true, true)?;
			}
		}

		let mut stats = Stats::new(version_uid);
		let mut completed = 0u64;
		while completed < dispatched {
			let (block_ref, data, checksum) = source.get().await?;
			completed += 1;
			let size = data.len() as u32;
			stats.bytes_read += size as u64;
			stats.blocks_read += 1;

			let dedup_hit = self
				.meta
				.get_block_by_checksum(&checksum)?
				.filter(|b| b.size == size);

			match dedup_hit {
				Some(existing) => {
					self.meta
						.set_block(version_uid, block_ref, existing.uid.as_deref(), Some(&checksum), size, true, true)?;
					stats.blocks_found_dedup += 1;
					stats.bytes_found_dedup += size as u64;
				}
				None => {
					let uid = self.data.save(&data).await?;
					self.meta
						.set_block(version_uid, block_ref, Some(&uid), Some(&checksum), size, true, true)?;
					stats.blocks_written += 1;
					stats.bytes_written += size as u64;
				}
			}
		}

		if completed != dispatched {
			self.meta.set_version_invalid(version_uid)?;
			return Err(Error::PipelineBroken(format!(
				"dispatched {} reads but collected {} completions",
				dispatched, completed
			)));
		}

		self.meta.set_version_valid(version_uid)?;
		self.meta.set_stats(&stats)?;
		Ok(())
	}

	/// Sample up to 10 inherited, non-read, non-sparse blocks and
	/// verify the source still matches their stored checksum, to
	/// catch a misapplied diff before committing to the full run.
	fn hint_sanity_check(
		&self,
		version_uid: &str,
		read_blocks: &HashSet<u64>,
		sparse_blocks: &HashSet<u64>,
		source: &Source,
	) -> Result<()> {
		let blocks = self.meta.get_blocks(version_uid)?;
		let candidate_ids: Vec<u64> = blocks
			.iter()
			.filter(|b| b.uid.is_some() && !read_blocks.contains(&b.id) && !sparse_blocks.contains(&b.id))
			.map(|b| b.id)
			.collect();
		let sample: Vec<u64> = candidate_ids.into_iter().choose_multiple(&mut rand::thread_rng(), 10);

		for id in sample {
			let block = self
				.meta
				.get_block(version_uid, id)?
				.ok_or_else(|| Error::Message(format!("missing block row {} for version {}", id, version_uid)))?;
			let (_, _, checksum) = source.read_sync(id)?;
			if Some(checksum) != block.checksum {
				return Err(Error::HintMismatch(id));
			}
		}
		Ok(())
	}

	pub async fn restore(&self, version_uid: &str, target_url: &str, sparse: bool, force: bool) -> Result<()> {
		let version = self
			.meta
			.get_version(version_uid)?
			.ok_or_else(|| Error::NotFound(version_uid.to_string()))?;
		let target = Target::open_w(target_url, self.block_size, version.size_bytes, force)?;

		for id in 0..version.size {
			let block = self
				.meta
				.get_block(version_uid, id)?
				.ok_or_else(|| Error::Message(format!("missing block row {} for version {}", id, version_uid)))?;

			match &block.uid {
				Some(uid) => match self.data.read(uid).await {
					Ok(data) => {
						let checksum = hash_block(&data);
						if block.checksum.as_deref() != Some(checksum.as_str()) {
							tracing::error!(version_uid, id, uid, "checksum mismatch restoring block");
							self.meta
								.set_blocks_invalid(uid, block.checksum.as_deref().unwrap_or(""))?;
						}
						target.write(id, data).await?;
					}
					Err(_) => {
						tracing::error!(version_uid, id, uid, "blob missing while restoring");
						self.meta
							.set_blocks_invalid(uid, block.checksum.as_deref().unwrap_or(""))?;
						if !sparse {
							target.write(id, vec![0u8; block.size as usize]).await?;
						}
					}
				},
				None => {
					if !sparse {
						target.write(id, vec![0u8; block.size as usize]).await?;
					}
				}
			}
		}

		target.close().await
	}

	pub async fn scrub(&self, version_uid: &str, source_url: Option<&str>, percentile: u8) -> Result<bool> {
		let version = self
			.meta
			.get_version(version_uid)?
			.ok_or_else(|| Error::NotFound(version_uid.to_string()))?;
		let source = match source_url {
			Some(url) => Some(Source::open(url, self.block_size, self.workers.clone())?),
			None => None,
		};

		let mut ok = true;
		let mut rng = rand::thread_rng();
		for id in 0..version.size {
			let block = self
				.meta
				.get_block(version_uid, id)?
				.ok_or_else(|| Error::Message(format!("missing block row {} for version {}", id, version_uid)))?;
			if block.is_sparse() {
				continue;
			}
			if !rand::Rng::gen_bool(&mut rng, (percentile as f64 / 100.0).clamp(0.0, 1.0)) {
				continue;
			}
			let uid = block.uid.as_deref().expect("non-sparse block has a uid");

			match self.data.read(uid).await {
				Ok(data) => {
					let checksum = hash_block(&data);
					let matches = data.len() as u32 == block.size && block.checksum.as_deref() == Some(checksum.as_str());
					if !matches {
						tracing::error!(version_uid, id, uid, "corrupt blob found during scrub");
						self.meta
							.set_blocks_invalid(uid, block.checksum.as_deref().unwrap_or(""))?;
						ok = false;
						continue;
					}
					if let Some(src) = &source {
						let (_, src_data, _) = src.read_sync(id)?;
						if src_data != data {
							tracing::error!(version_uid, id, "source drifted from backed-up block");
							ok = false;
						}
					}
				}
				Err(_) => {
					tracing::error!(version_uid, id, uid, "blob missing during scrub");
					self.meta
						.set_blocks_invalid(uid, block.checksum.as_deref().unwrap_or(""))?;
					ok = false;
				}
			}
		}

		if ok {
			self.meta.set_version_valid(version_uid)?;
		}
		Ok(ok)
	}

	pub fn rm(&self, version_uid: &str, force: bool, min_age_days: i64) -> Result<()> {
		let version = self
			.meta
			.get_version(version_uid)?
			.ok_or_else(|| Error::NotFound(version_uid.to_string()))?;
		if !force {
			let age = backym_util::time::age_days(&version.date);
			if age < min_age_days {
				return Err(Error::TooYoung(version_uid.to_string()));
			}
		}
		let guard = self
			.lock
			.acquire(version_uid)?
			.ok_or_else(|| Error::Locked(version_uid.to_string()))?;
		self.meta.rm_version(version_uid)?;
		drop(guard);
		Ok(())
	}

	pub async fn cleanup_fast(&self, grace_seconds: i64) -> Result<u64> {
		let guard = self
			.lock
			.acquire(CLEANUP_FAST_LOCK)?
			.ok_or_else(|| Error::Locked(CLEANUP_FAST_LOCK.to_string()))?;

		let mut removed = 0u64;
		loop {
			let batch = self.meta.get_delete_candidates(grace_seconds)?;
			if batch.is_empty() {
				break;
			}
			let not_deleted = self.data.rm_many(&batch).await?;
			removed += (batch.len() - not_deleted.len()) as u64;
			self.meta.forget_refcounts(&batch)?;
		}

		drop(guard);
		Ok(removed)
	}

	pub async fn cleanup_full(&self, prefix: Option<&str>) -> Result<u64> {
		let guard = self
			.lock
			.acquire(GLOBAL_LOCK)?
			.ok_or_else(|| Error::Locked(GLOBAL_LOCK.to_string()))?;
		peers::refuse_if_peer_alive(self.lock.dir(), std::process::id())?;

		let meta_uids: HashSet<String> = self.meta.get_all_block_uids(prefix)?.into_iter().collect();
		let data_uids = self.data.get_all_blob_uids(prefix).await?;
		let orphans: Vec<String> = data_uids.into_iter().filter(|u| !meta_uids.contains(u)).collect();
		let not_deleted = self.data.rm_many(&orphans).await?;

		drop(guard);
		Ok((orphans.len() - not_deleted.len()) as u64)
	}

	pub fn export(&self, version_uid: &str, sink: &mut dyn std::io::Write) -> Result<()> {
		self.meta.export(version_uid, sink)
	}

	/// Imports a version, then immediately locks its freshly-minted
	/// uid so a concurrent caller cannot mutate it before the import
	/// finishes registering. `backym_meta`'s textual format does not
	/// expose the uid until the dump has been parsed in full, so the
	/// lock is taken as soon as it is known rather than strictly
	/// before the row becomes visible.
	pub fn import(&self, source: &mut dyn std::io::BufRead) -> Result<String> {
		let uid = self.meta.import(source)?;
		match self.lock.acquire(&uid)? {
			Some(guard) => drop(guard),
			None => return Err(Error::Locked(uid)),
		}
		Ok(uid)
	}

	pub fn ls(&self, name_filter: Option<&str>, with_stats: bool) -> Result<Vec<(Version, Option<Stats>)>> {
		let versions = self.meta.get_versions(name_filter)?;
		versions
			.into_iter()
			.map(|v| {
				let stats = if with_stats { self.meta.get_stats(&v.uid)? } else { None };
				Ok((v, stats))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use backym_util::config::{Config, DataBackendKind, MetaEngine};

	fn test_config(dir: &std::path::Path) -> Config {
		Config {
			data_dir: dir.join("data"),
			meta_dir: dir.join("meta"),
			lock_dir: dir.join("lock"),
			block_size: 4,
			hash: "sha512".to_string(),
			meta_engine: MetaEngine::Sqlite,
			data_backend: DataBackendKind::Files,
			largefile_segment_size: 4096,
			cleanup_fast_grace_seconds: 3600,
			process_name: "test:1".to_string(),
		}
	}

	fn write_source(dir: &std::path::Path, name: &str, content: &[u8]) -> String {
		let path = dir.join(name);
		std::fs::write(&path, content).unwrap();
		format!("file://{}", path.to_str().unwrap())
	}

	#[tokio::test]
	async fn s1_sparse_only_backup_of_a_short_source() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src = write_source(&dir, "src.img", &[0u8; 10]);
		let uid = engine.backup("vm1", &src, None, None).await.unwrap();

		let version = engine.meta.get_version(&uid).unwrap().unwrap();
		assert!(version.valid);
		assert_eq!(version.size, 3);
		assert_eq!(version.size_bytes, 10);

		let blocks = engine.meta.get_blocks(&uid).unwrap();
		assert!(blocks.iter().all(|b| b.is_sparse() && b.valid));
		assert_eq!(blocks.iter().map(|b| b.size).sum::<u32>(), 10);

		let dst_path = dir.join("restored.img");
		let dst = format!("file://{}", dst_path.to_str().unwrap());
		engine.restore(&uid, &dst, false, true).await.unwrap();
		assert_eq!(std::fs::read(&dst_path).unwrap(), vec![0u8; 10]);
	}

	#[tokio::test]
	async fn s2_identical_first_blocks_dedup_to_one_blob() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src_a = write_source(&dir, "a.img", b"AAAABBBB");
		let src_b = write_source(&dir, "b.img", b"AAAACCCC");

		engine.backup("vm-a", &src_a, None, None).await.unwrap();
		let uid_b = engine.backup("vm-b", &src_b, None, None).await.unwrap();

		let stats_b = engine.meta.get_stats(&uid_b).unwrap().unwrap();
		assert!(stats_b.blocks_found_dedup >= 1);

		let all_uids = engine.meta.get_all_block_uids(None).unwrap();
		// two distinct contents beyond the shared first block: "AAAA" once, "BBBB" once, "CCCC" once
		assert_eq!(all_uids.len(), 3);
	}

	#[tokio::test]
	async fn s3_scrub_detects_external_corruption_and_invalidates_the_version() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src = write_source(&dir, "src.img", b"AAAABBBB");
		let uid = engine.backup("vm1", &src, None, None).await.unwrap();

		let blob_uid = engine
			.meta
			.get_block(&uid, 0)
			.unwrap()
			.unwrap()
			.uid
			.unwrap();
		let blob_path = dir.join("data").join(&blob_uid[0..2]).join(&blob_uid[2..4]).join(&blob_uid);
		std::fs::write(&blob_path, b"XXXX").unwrap();

		let ok = engine.scrub(&uid, None, 100).await.unwrap();
		assert!(!ok);
		assert!(!engine.meta.get_version(&uid).unwrap().unwrap().valid);

		let from_corrupt = engine.prepare_version("vm1", 8, Some(&uid));
		assert!(matches!(from_corrupt, Err(Error::InvalidBase(_))));
	}

	#[tokio::test]
	async fn s5_gc_respects_the_grace_period() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src = write_source(&dir, "src.img", b"AAAABBBB");
		let uid = engine.backup("vm1", &src, None, None).await.unwrap();
		engine.rm(&uid, true, 0).unwrap();

		let removed_immediately = engine.cleanup_fast(3600).await.unwrap();
		assert_eq!(removed_immediately, 0);

		let removed = engine.cleanup_fast(0).await.unwrap();
		assert_eq!(removed, 2);
	}

	#[tokio::test]
	async fn backup_then_restore_is_bit_identical_to_the_source() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let content: Vec<u8> = (0..37u32).map(|i| (i * 7) as u8).collect();
		let src = write_source(&dir, "src.img", &content);
		let uid = engine.backup("vm1", &src, None, None).await.unwrap();
		assert!(engine.meta.get_version(&uid).unwrap().unwrap().valid);

		let dst_path = dir.join("restored.img");
		let dst = format!("file://{}", dst_path.to_str().unwrap());
		engine.restore(&uid, &dst, false, true).await.unwrap();
		assert_eq!(std::fs::read(&dst_path).unwrap(), content);
	}

	#[tokio::test]
	async fn s4_a_drifted_untouched_block_fails_the_hint_sanity_check() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src_a = write_source(&dir, "a.img", b"AAAABBBBCCCC");
		let uid_a = engine.backup("vm1", &src_a, None, None).await.unwrap();

		// Hints claim only block 0 changed, but block 2 ("CCCC" ->
		// "DDDD") drifted too without being declared.
		let src_b = write_source(&dir, "b.img", b"AAAABBBBDDDD");
		let hints = vec![Hint { offset: 0, length: 4, exists: true }];

		let result = engine.backup("vm1", &src_b, Some(hints), Some(&uid_a)).await;
		assert!(matches!(result, Err(Error::HintMismatch(_))));

		let versions = engine.meta.get_versions(Some("vm1")).unwrap();
		assert_eq!(versions.len(), 1);
		assert_eq!(versions[0].uid, uid_a);
	}

	#[tokio::test]
	async fn s6_restoring_sparse_leaves_a_hole_while_non_sparse_zero_fills() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let engine = Engine::new(&test_config(&dir)).unwrap();

		let src = write_source(&dir, "src.img", b"AAAA____BBBB");
		let hints = vec![
			Hint { offset: 0, length: 4, exists: true },
			Hint { offset: 4, length: 4, exists: false },
			Hint { offset: 8, length: 4, exists: true },
		];
		let uid = engine.backup("vm1", &src, Some(hints), None).await.unwrap();

		let middle = engine.meta.get_block(&uid, 1).unwrap().unwrap();
		assert!(middle.is_sparse());

		let sparse_path = dir.join("restored_sparse.img");
		let sparse_dst = format!("file://{}", sparse_path.to_str().unwrap());
		engine.restore(&uid, &sparse_dst, true, true).await.unwrap();
		let sparse_out = std::fs::read(&sparse_path).unwrap();

		let zero_path = dir.join("restored_zero.img");
		let zero_dst = format!("file://{}", zero_path.to_str().unwrap());
		engine.restore(&uid, &zero_dst, false, true).await.unwrap();
		let zero_out = std::fs::read(&zero_path).unwrap();

		// Both modes produce the same logical content: the middle
		// block reads back as zero bytes whether or not it was
		// explicitly written.
		assert_eq!(sparse_out.len(), 12);
		assert_eq!(zero_out.len(), 12);
		assert_eq!(&sparse_out[0..4], b"AAAA");
		assert_eq!(&sparse_out[4..8], &[0u8; 4]);
		assert_eq!(&sparse_out[8..12], b"BBBB");
		assert_eq!(sparse_out, zero_out);
	}
}
