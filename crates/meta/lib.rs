//! Transactional store of versions, blocks, refcounts and stats,
//! built on the pluggable key/value engine in `backym_db`.

pub mod dump;
pub mod model;
mod refcount;

use std::ops::Bound;
use std::path::Path;

use chrono::Local;
use rand::RngCore;

use backym_db::Db;
use backym_util::config::{Config, MetaEngine};
use backym_util::error::{Error, Result};

pub use model::{Block, RefCount, Stats, Version};

const VERSION_TREE: &str = "versions";
const VERSION_BY_NAME_TREE: &str = "versions_by_name";
const BLOCK_TREE: &str = "blocks";
const REFCOUNT_TREE: &str = "refcounts";
const STATS_TREE: &str = "stats";

pub struct MetaBackend {
	db: Db,
	versions: backym_db::Tree,
	versions_by_name: backym_db::Tree,
	blocks: backym_db::Tree,
	refcounts: backym_db::Tree,
	stats: backym_db::Tree,
}

/// Mint a fresh, time-ordered, 36-character version identifier
/// (same textual shape as a UUID).
pub fn mint_version_uid() -> String {
	let millis = Local::now().timestamp_millis() as u64;
	let mut rand_bytes = [0u8; 10];
	rand::thread_rng().fill_bytes(&mut rand_bytes);
	format!(
		"{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
		(millis >> 16) & 0xffff_ffff,
		millis & 0xffff,
		u16::from_be_bytes([rand_bytes[0], rand_bytes[1]]),
		u16::from_be_bytes([rand_bytes[2], rand_bytes[3]]),
		u64::from_be_bytes([
			0,
			0,
			rand_bytes[4],
			rand_bytes[5],
			rand_bytes[6],
			rand_bytes[7],
			rand_bytes[8],
			rand_bytes[9],
		])
	)
}

/// Open the embedded engine selected by `config.meta_engine` and wrap
/// it as a `MetaBackend`.
pub fn open(config: &Config) -> Result<MetaBackend> {
	std::fs::create_dir_all(&config.meta_dir)?;
	let db = open_db(&config.meta_dir, config.meta_engine)?;
	MetaBackend::new(db)
}

fn open_db(meta_dir: &Path, engine: MetaEngine) -> Result<Db> {
	match engine {
		MetaEngine::Sqlite => {
			let path = meta_dir.join("backym.sqlite");
			let conn = backym_db::sqlite_adapter::rusqlite::Connection::open(&path)
				.map_err(|e| Error::Message(format!("{}", e)))?;
			Ok(backym_db::sqlite_adapter::SqliteDb::init(conn))
		}
		MetaEngine::Sled => {
			let db = backym_db::sled_adapter::sled::open(meta_dir)
				.map_err(|e| Error::Message(format!("{}", e)))?;
			Ok(backym_db::sled_adapter::SledDb::init(db))
		}
		MetaEngine::Lmdb => {
			let env = backym_db::lmdb_adapter::heed::EnvOpenOptions::new()
				.map_size(1 << 40)
				.max_dbs(16)
				.open(meta_dir)
				.map_err(|e| Error::Message(format!("{}", e)))?;
			Ok(backym_db::lmdb_adapter::LmdbDb::init(env))
		}
	}
}

fn block_key(version_uid: &str, id: u64) -> Vec<u8> {
	let mut key = version_uid.as_bytes().to_vec();
	key.extend_from_slice(&id.to_be_bytes());
	key
}

fn name_index_key(name: &str, date_millis: i64, version_uid: &str) -> Vec<u8> {
	let mut key = name.as_bytes().to_vec();
	key.push(0);
	key.extend_from_slice(&date_millis.to_be_bytes());
	key.extend_from_slice(version_uid.as_bytes());
	key
}

impl MetaBackend {
	pub fn new(db: Db) -> Result<Self> {
		Ok(Self {
			versions: db.open_tree(VERSION_TREE)?,
			versions_by_name: db.open_tree(VERSION_BY_NAME_TREE)?,
			blocks: db.open_tree(BLOCK_TREE)?,
			refcounts: db.open_tree(REFCOUNT_TREE)?,
			stats: db.open_tree(STATS_TREE)?,
			db,
		})
	}

	pub fn db(&self) -> &Db {
		&self.db
	}

	// ---- versions ----

	pub fn set_version(&self, name: &str, size: u64, size_bytes: u64, valid: bool) -> Result<Version> {
		let version = Version {
			uid: mint_version_uid(),
			name: name.to_string(),
			date: Local::now(),
			size,
			size_bytes,
			valid,
		};
		self.versions.insert(
			version.uid.as_bytes(),
			serde_json::to_vec(&version).expect("serialize version"),
		)?;
		self.versions_by_name.insert(
			name_index_key(&version.name, version.date.timestamp_millis(), &version.uid),
			version.uid.as_bytes(),
		)?;
		Ok(version)
	}

	pub fn get_version(&self, uid: &str) -> Result<Option<Version>> {
		match self.versions.get(uid.as_bytes())? {
			Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).expect("corrupt version row"))),
			None => Ok(None),
		}
	}

	/// All versions, ordered by `(name, date)`. If `name_filter` is
	/// given, only versions with that exact name are returned.
	pub fn get_versions(&self, name_filter: Option<&str>) -> Result<Vec<Version>> {
		let mut out = Vec::new();
		for item in self.versions_by_name.iter()? {
			let (key, value) = item?;
			if let Some(name) = name_filter {
				if !key.starts_with(name.as_bytes()) || key.get(name.len()) != Some(&0) {
					continue;
				}
			}
			let uid = String::from_utf8(value).expect("corrupt index row");
			if let Some(v) = self.get_version(&uid)? {
				out.push(v);
			}
		}
		Ok(out)
	}

	pub fn set_version_valid(&self, uid: &str) -> Result<()> {
		self.set_version_validity(uid, true)
	}

	pub fn set_version_invalid(&self, uid: &str) -> Result<()> {
		self.set_version_validity(uid, false)
	}

	fn set_version_validity(&self, uid: &str, valid: bool) -> Result<()> {
		let mut version = self
			.get_version(uid)?
			.ok_or_else(|| Error::Message(format!("version {} not found", uid)))?;
		version.valid = valid;
		self.versions.insert(
			version.uid.as_bytes(),
			serde_json::to_vec(&version).expect("serialize version"),
		)?;
		Ok(())
	}

	// ---- blocks ----

	pub fn get_block(&self, version_uid: &str, id: u64) -> Result<Option<Block>> {
		match self.blocks.get(block_key(version_uid, id))? {
			Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).expect("corrupt block row"))),
			None => Ok(None),
		}
	}

	pub fn get_blocks(&self, version_uid: &str) -> Result<Vec<Block>> {
		let low = block_key(version_uid, 0);
		let high = block_key(version_uid, u64::MAX);
		let mut out = Vec::new();
		for item in self
			.blocks
			.range((Bound::Included(&low[..]), Bound::Included(&high[..])))?
		{
			let (_, value) = item?;
			out.push(serde_json::from_slice(&value).expect("corrupt block row"));
		}
		Ok(out)
	}

	/// Upsert a block row. When the stored `uid` changes, the old
	/// uid's refcount is decremented and the new uid's incremented
	/// (nulls are skipped on both sides). `upsert=false` is the fast
	/// insert-only path used while `prepare_version` seeds a fresh
	/// version: callers must guarantee no row for `(version_uid, id)`
	/// already exists.
	pub fn set_block(
		&self,
		version_uid: &str,
		id: u64,
		uid: Option<&str>,
		checksum: Option<&str>,
		size: u32,
		valid: bool,
		upsert: bool,
	) -> Result<()> {
		let key = block_key(version_uid, id);
		let new_block = Block {
			version_uid: version_uid.to_string(),
			id,
			uid: uid.map(|s| s.to_string()),
			checksum: checksum.map(|s| s.to_string()),
			size,
			date: Local::now(),
			valid,
		};

		let old_uid = if upsert {
			match self.blocks.get(&key)? {
				Some(bytes) => {
					let old: Block = serde_json::from_slice(&bytes).expect("corrupt block row");
					old.uid
				}
				None => None,
			}
		} else {
			None
		};

		self.db
			.transaction(|mut tx| {
				if old_uid.as_deref() != new_block.uid.as_deref() {
					if let Some(old) = old_uid.as_deref() {
						refcount::ref_del(&mut tx, &self.refcounts, old)?;
					}
					if let Some(new) = new_block.uid.as_deref() {
						refcount::ref_add(&mut tx, &self.refcounts, new)?;
					}
				}
				tx.insert(
					&self.blocks,
					&key,
					serde_json::to_vec(&new_block).expect("serialize block"),
				)?;
				tx.commit(())
			})
			.map_err(tx_to_meta_error)?;

		Ok(())
	}

	/// Dedup lookup: the most recently written valid block whose
	/// content hashes to `checksum`, if any. Invalid blocks are never
	/// returned, so corruption cannot propagate through reuse.
	pub fn get_block_by_checksum(&self, checksum: &str) -> Result<Option<Block>> {
		for item in self.blocks.iter()? {
			let (_, value) = item?;
			let block: Block = serde_json::from_slice(&value).expect("corrupt block row");
			if block.valid && block.checksum.as_deref() == Some(checksum) {
				return Ok(Some(block));
			}
		}
		Ok(None)
	}

	/// Mark every block row with this `(uid, checksum)` pair invalid,
	/// then mark every version owning one of those blocks invalid.
	/// Returns the affected version uids.
	pub fn set_blocks_invalid(&self, uid: &str, checksum: &str) -> Result<Vec<String>> {
		let mut affected_versions = Vec::new();
		let mut to_update = Vec::new();
		for item in self.blocks.iter()? {
			let (key, value) = item?;
			let mut block: Block = serde_json::from_slice(&value).expect("corrupt block row");
			if block.uid.as_deref() == Some(uid) && block.checksum.as_deref() == Some(checksum) {
				block.valid = false;
				if !affected_versions.contains(&block.version_uid) {
					affected_versions.push(block.version_uid.clone());
				}
				to_update.push((key, block));
			}
		}
		for (key, block) in &to_update {
			self.blocks
				.insert(key, serde_json::to_vec(block).expect("serialize block"))?;
		}
		for version_uid in &affected_versions {
			self.set_version_invalid(version_uid)?;
		}
		Ok(affected_versions)
	}

	/// Delete a version and all of its block rows, decrementing
	/// refcounts for each. Returns the number of block rows removed.
	pub fn rm_version(&self, version_uid: &str) -> Result<usize> {
		let version = self
			.get_version(version_uid)?
			.ok_or_else(|| Error::Message(format!("version {} not found", version_uid)))?;
		let blocks = self.get_blocks(version_uid)?;
		let n = blocks.len();

		let name_key = name_index_key(&version.name, version.date.timestamp_millis(), &version.uid);

		self.db
			.transaction(|mut tx| {
				for block in &blocks {
					if let Some(uid) = block.uid.as_deref() {
						refcount::ref_del(&mut tx, &self.refcounts, uid)?;
					}
				}
				for block in &blocks {
					tx.remove(&self.blocks, block_key(version_uid, block.id))?;
				}
				tx.remove(&self.versions, version_uid.as_bytes())?;
				tx.remove(&self.versions_by_name, &name_key)?;
				tx.commit(())
			})
			.map_err(tx_to_meta_error)?;

		Ok(n)
	}

	// ---- refcounts / GC ----

	pub fn get_refcount(&self, uid: &str) -> Result<Option<RefCount>> {
		refcount::get(&self.refcounts, uid)
	}

	/// Batches of uids with zero refs, last modified before the grace
	/// horizon. The caller must remove each batch from the data
	/// backend and then call `forget_refcounts` before requesting the
	/// next batch.
	pub fn get_delete_candidates(&self, grace_seconds: i64) -> Result<Vec<String>> {
		let horizon = Local::now() - chrono::Duration::seconds(grace_seconds);
		let mut out = Vec::new();
		for item in self.refcounts.iter()? {
			let (key, value) = item?;
			let rc: RefCount = serde_json::from_slice(&value).expect("corrupt refcount row");
			if rc.refs == 0 && rc.modified < horizon {
				out.push(String::from_utf8(key).expect("corrupt refcount key"));
				if out.len() >= 100 {
					break;
				}
			}
		}
		Ok(out)
	}

	pub fn forget_refcounts(&self, uids: &[String]) -> Result<()> {
		for uid in uids {
			self.refcounts.remove(uid.as_bytes())?;
		}
		Ok(())
	}

	/// Distinct non-null blob uids referenced by any block, optionally
	/// filtered to a textual prefix.
	pub fn get_all_block_uids(&self, prefix: Option<&str>) -> Result<Vec<String>> {
		let mut out = std::collections::HashSet::new();
		for item in self.blocks.iter()? {
			let (_, value) = item?;
			let block: Block = serde_json::from_slice(&value).expect("corrupt block row");
			if let Some(uid) = block.uid {
				if prefix.map(|p| uid.starts_with(p)).unwrap_or(true) {
					out.insert(uid);
				}
			}
		}
		Ok(out.into_iter().collect())
	}

	// ---- stats ----

	pub fn set_stats(&self, stats: &Stats) -> Result<()> {
		self.stats.insert(
			stats.version_uid.as_bytes(),
			serde_json::to_vec(stats).expect("serialize stats"),
		)?;
		Ok(())
	}

	pub fn get_stats(&self, version_uid: &str) -> Result<Option<Stats>> {
		match self.stats.get(version_uid.as_bytes())? {
			Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).expect("corrupt stats row"))),
			None => Ok(None),
		}
	}

	// ---- export / import ----

	pub fn export(&self, version_uid: &str, sink: &mut dyn std::io::Write) -> Result<()> {
		let version = self
			.get_version(version_uid)?
			.ok_or_else(|| Error::Message(format!("version {} not found", version_uid)))?;
		let blocks = self.get_blocks(version_uid)?;
		dump::write_version(sink, &version, &blocks)
	}

	pub fn import(&self, source: &mut dyn std::io::BufRead) -> Result<String> {
		let (version, blocks) = dump::read_version(source)?;
		if self.get_version(&version.uid)?.is_some() {
			return Err(Error::Message(format!(
				"version {} already exists",
				version.uid
			)));
		}

		self.versions.insert(
			version.uid.as_bytes(),
			serde_json::to_vec(&version).expect("serialize version"),
		)?;
		self.versions_by_name.insert(
			name_index_key(&version.name, version.date.timestamp_millis(), &version.uid),
			version.uid.as_bytes(),
		)?;
		for block in &blocks {
			self.blocks.insert(
				block_key(&block.version_uid, block.id),
				serde_json::to_vec(block).expect("serialize block"),
			)?;
			if let Some(uid) = block.uid.as_deref() {
				self.db
					.transaction(|mut tx| {
						refcount::ref_add(&mut tx, &self.refcounts, uid)?;
						tx.commit(())
					})
					.map_err(tx_to_meta_error)?;
			}
		}
		Ok(version.uid)
	}
}

fn tx_to_meta_error(e: backym_db::TxError<Error>) -> Error {
	match e {
		backym_db::TxError::Abort(e) => e,
		backym_db::TxError::Db(e) => Error::Db(e),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open_test_backend() -> MetaBackend {
		let conn = backym_db::sqlite_adapter::rusqlite::Connection::open_in_memory().unwrap();
		let db = backym_db::sqlite_adapter::SqliteDb::init(conn);
		MetaBackend::new(db).unwrap()
	}

	#[test]
	fn refcount_protocol_tracks_shared_blocks() {
		let m = open_test_backend();
		let v1 = m.set_version("vm1", 2, 8 * 1024 * 1024, false).unwrap();
		let v2 = m.set_version("vm2", 2, 8 * 1024 * 1024, false).unwrap();

		m.set_block(&v1.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, false)
			.unwrap();
		m.set_block(&v2.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, false)
			.unwrap();

		assert_eq!(m.get_refcount("blob-a").unwrap().unwrap().refs, 2);

		m.rm_version(&v1.uid).unwrap();
		assert_eq!(m.get_refcount("blob-a").unwrap().unwrap().refs, 1);

		m.rm_version(&v2.uid).unwrap();
		assert_eq!(m.get_refcount("blob-a").unwrap().unwrap().refs, 0);
	}

	#[test]
	fn dedup_lookup_ignores_invalid_blocks() {
		let m = open_test_backend();
		let v = m.set_version("vm1", 1, 4 * 1024 * 1024, true).unwrap();
		m.set_block(&v.uid, 0, Some("blob-a"), Some("sum-a"), 4096, false, false)
			.unwrap();

		assert!(m.get_block_by_checksum("sum-a").unwrap().is_none());

		m.set_block(&v.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, true)
			.unwrap();
		let found = m.get_block_by_checksum("sum-a").unwrap().unwrap();
		assert_eq!(found.uid.as_deref(), Some("blob-a"));
	}

	#[test]
	fn invalidating_a_blob_cascades_to_owning_versions() {
		let m = open_test_backend();
		let v1 = m.set_version("vm1", 1, 4 * 1024 * 1024, true).unwrap();
		let v2 = m.set_version("vm2", 1, 4 * 1024 * 1024, true).unwrap();
		m.set_block(&v1.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, false)
			.unwrap();
		m.set_block(&v2.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, false)
			.unwrap();

		let mut affected = m.set_blocks_invalid("blob-a", "sum-a").unwrap();
		affected.sort();
		let mut expected = vec![v1.uid.clone(), v2.uid.clone()];
		expected.sort();
		assert_eq!(affected, expected);

		assert!(!m.get_version(&v1.uid).unwrap().unwrap().valid);
		assert!(!m.get_version(&v2.uid).unwrap().unwrap().valid);
		assert!(m.get_block(&v1.uid, 0).unwrap().unwrap().valid == false);
	}

	#[test]
	fn export_import_round_trips_a_version() {
		let m = open_test_backend();
		let v = m.set_version("vm1", 2, 8 * 1024 * 1024, true).unwrap();
		m.set_block(&v.uid, 0, Some("blob-a"), Some("sum-a"), 4 * 1024 * 1024, true, false)
			.unwrap();
		m.set_block(&v.uid, 1, None, None, 4 * 1024 * 1024, true, false)
			.unwrap();

		let mut buf = Vec::new();
		m.export(&v.uid, &mut buf).unwrap();

		let m2 = open_test_backend();
		let imported_uid = m2.import(&mut &buf[..]).unwrap();
		assert_eq!(imported_uid, v.uid);

		let imported = m2.get_version(&imported_uid).unwrap().unwrap();
		assert_eq!(imported.name, "vm1");
		let blocks = m2.get_blocks(&imported_uid).unwrap();
		assert_eq!(blocks.len(), 2);
		assert_eq!(m2.get_refcount("blob-a").unwrap().unwrap().refs, 1);
	}

	#[test]
	fn get_versions_filters_by_name_and_orders_by_date() {
		let m = open_test_backend();
		m.set_version("vm1", 1, 4096, true).unwrap();
		m.set_version("vm2", 1, 4096, true).unwrap();
		m.set_version("vm1", 1, 4096, true).unwrap();

		let vm1 = m.get_versions(Some("vm1")).unwrap();
		assert_eq!(vm1.len(), 2);
		assert!(vm1.iter().all(|v| v.name == "vm1"));

		let all = m.get_versions(None).unwrap();
		assert_eq!(all.len(), 3);
	}

	#[test]
	fn delete_candidates_respect_the_grace_period() {
		let m = open_test_backend();
		let v = m.set_version("vm1", 1, 4096, true).unwrap();
		m.set_block(&v.uid, 0, Some("blob-a"), Some("sum-a"), 4096, true, false)
			.unwrap();
		m.rm_version(&v.uid).unwrap();

		assert!(m.get_delete_candidates(3600).unwrap().is_empty());
		let candidates = m.get_delete_candidates(-1).unwrap();
		assert_eq!(candidates, vec!["blob-a".to_string()]);

		m.forget_refcounts(&candidates).unwrap();
		assert!(m.get_refcount("blob-a").unwrap().is_none());
	}
}
