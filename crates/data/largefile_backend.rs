//! Packed large-file data backend (`§6`): blobs are packed into
//! fixed-size segment files. Each segment holds a region of
//! `block_size`-sized slots, followed by a fixed-width index of
//! `(uid, size)` records (one per slot), followed by a small ascii
//! trailer giving the segment's slot capacity. A slot whose index
//! record has `size == 0` is free.
//!
//! This backend targets a single writer (see Non-goals on multi-writer
//! concurrency): all segment state is held behind one mutex.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use backym_util::error::{Error, Result};

use crate::{mint_uid, not_found, DataBackend};

const UID_LEN: usize = 32;
const SIZE_LEN: usize = 10;
const RECORD_LEN: usize = UID_LEN + SIZE_LEN;
const TRAILER_LEN: usize = 16;

struct Segment {
	file: File,
	n_slots: u64,
	slots_region_len: u64,
	free_slots: Vec<u64>,
}

struct Location {
	segment: usize,
	slot: u64,
	size: usize,
}

struct State {
	segments: Vec<Segment>,
	index: HashMap<String, Location>,
}

pub struct LargefileBackend {
	dir: PathBuf,
	block_size: u64,
	segment_size: u64,
	state: Mutex<State>,
}

impl LargefileBackend {
	pub fn open(dir: PathBuf, block_size: u64, configured_segment_size: u64) -> Result<Self> {
		std::fs::create_dir_all(&dir)?;
		let segment_size = (configured_segment_size / block_size) * block_size;
		if segment_size == 0 {
			return Err(Error::Message(
				"largefile_segment_size must be at least one block".into(),
			));
		}

		let mut segment_paths: Vec<(u64, PathBuf)> = Vec::new();
		for entry in std::fs::read_dir(&dir)? {
			let entry = entry?;
			let name = entry.file_name().into_string().unwrap_or_default();
			if let Some(n) = name
				.strip_prefix("segment-")
				.and_then(|s| s.strip_suffix(".lf"))
				.and_then(|s| s.parse::<u64>().ok())
			{
				segment_paths.push((n, entry.path()));
			}
		}
		segment_paths.sort_by_key(|(n, _)| *n);

		let mut segments = Vec::new();
		let mut index = HashMap::new();
		for (n, path) in segment_paths {
			let segment = open_existing_segment(&path, block_size, n as usize, &mut index)?;
			segments.push(segment);
		}

		Ok(Self {
			dir,
			block_size,
			segment_size,
			state: Mutex::new(State { segments, index }),
		})
	}

	fn segment_path(&self, n: usize) -> PathBuf {
		self.dir.join(format!("segment-{:06}.lf", n))
	}

	fn create_segment(&self, n: usize) -> Result<Segment> {
		let n_slots = self.segment_size / self.block_size;
		let total_len = self.segment_size + n_slots * RECORD_LEN as u64 + TRAILER_LEN as u64;

		let path = self.segment_path(n);
		let mut file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)?;
		file.set_len(total_len)?;
		file.seek(SeekFrom::Start(self.segment_size + n_slots * RECORD_LEN as u64))?;
		write!(file, "{:>width$}", n_slots, width = TRAILER_LEN)?;
		file.sync_all()?;

		Ok(Segment {
			file,
			n_slots,
			slots_region_len: self.segment_size,
			free_slots: (0..n_slots).rev().collect(),
		})
	}
}

fn open_existing_segment(
	path: &Path,
	block_size: u64,
	segment_idx: usize,
	index: &mut HashMap<String, Location>,
) -> Result<Segment> {
	let file = OpenOptions::new().read(true).write(true).open(path)?;
	let len = file.metadata()?.len();
	let n_slots = (len - TRAILER_LEN as u64) / (block_size + RECORD_LEN as u64);
	let slots_region_len = n_slots * block_size;

	let mut free_slots = Vec::new();
	for slot in 0..n_slots {
		let mut record = [0u8; RECORD_LEN];
		file.read_exact_at(&mut record, slots_region_len + slot * RECORD_LEN as u64)?;
		let uid = String::from_utf8_lossy(&record[..UID_LEN]).to_string();
		let size_str = String::from_utf8_lossy(&record[UID_LEN..]).to_string();
		let size: usize = size_str.trim().parse().unwrap_or(0);
		if size == 0 {
			free_slots.push(slot);
		} else {
			index.insert(
				uid,
				Location {
					segment: segment_idx,
					slot,
					size,
				},
			);
		}
	}
	free_slots.reverse();

	Ok(Segment {
		file,
		n_slots,
		slots_region_len,
		free_slots,
	})
}

impl Segment {
	fn write_record(&self, slot: u64, uid: &str, size: usize) -> Result<()> {
		let mut record = [0u8; RECORD_LEN];
		record[..UID_LEN].copy_from_slice(uid.as_bytes());
		let size_str = format!("{:0width$}", size, width = SIZE_LEN);
		record[UID_LEN..].copy_from_slice(size_str.as_bytes());
		self.file
			.write_all_at(&record, self.slots_region_len + slot * RECORD_LEN as u64)?;
		Ok(())
	}
}

#[async_trait]
impl DataBackend for LargefileBackend {
	async fn save(&self, data: &[u8]) -> Result<String> {
		if data.len() as u64 > self.block_size {
			return Err(Error::Message(format!(
				"block of {} bytes exceeds configured block_size",
				data.len()
			)));
		}

		let mut state = self.state.lock().unwrap();

		let uid = loop {
			let candidate = mint_uid();
			if !state.index.contains_key(&candidate) {
				break candidate;
			}
		};

		let mut target = None;
		for (i, seg) in state.segments.iter_mut().enumerate() {
			if let Some(slot) = seg.free_slots.pop() {
				target = Some((i, slot));
				break;
			}
		}

		let (seg_idx, slot) = match target {
			Some(x) => x,
			None => {
				let new_idx = state.segments.len();
				let mut segment = self.create_segment(new_idx)?;
				let slot = segment.free_slots.pop().expect("fresh segment has slots");
				state.segments.push(segment);
				(new_idx, slot)
			}
		};

		let segment = &state.segments[seg_idx];
		segment
			.file
			.write_all_at(data, slot * self.block_size)?;
		segment.write_record(slot, &uid, data.len())?;

		state.index.insert(
			uid.clone(),
			Location {
				segment: seg_idx,
				slot,
				size: data.len(),
			},
		);

		Ok(uid)
	}

	async fn read(&self, uid: &str) -> Result<Vec<u8>> {
		let state = self.state.lock().unwrap();
		let loc = state.index.get(uid).ok_or_else(|| not_found(uid))?;
		let segment = &state.segments[loc.segment];
		let mut buf = vec![0u8; loc.size];
		segment
			.file
			.read_exact_at(&mut buf, loc.slot * self.block_size)?;
		Ok(buf)
	}

	async fn rm(&self, uid: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(loc) = state.index.remove(uid) {
			state.segments[loc.segment].write_record(loc.slot, "", 0)?;
			state.segments[loc.segment].free_slots.push(loc.slot);
		}
		Ok(())
	}

	async fn get_all_blob_uids(&self, prefix: Option<&str>) -> Result<Vec<String>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.index
			.keys()
			.filter(|uid| prefix.map(|p| uid.starts_with(p)).unwrap_or(true))
			.cloned()
			.collect())
	}

	async fn close(&self) -> Result<()> {
		let state = self.state.lock().unwrap();
		for seg in &state.segments {
			seg.file.sync_all()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn save_read_rm_round_trips() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let backend = LargefileBackend::open(tmp.to_path_buf(), 4, 16).unwrap();

		let uid = backend.save(b"abcd").await.unwrap();
		assert_eq!(backend.read(&uid).await.unwrap(), b"abcd");
		backend.rm(&uid).await.unwrap();
		assert!(backend.read(&uid).await.is_err());
	}

	#[tokio::test]
	async fn rolls_over_to_a_new_segment_when_full() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		// one slot per segment (segment_size == block_size)
		let backend = LargefileBackend::open(tmp.to_path_buf(), 4, 4).unwrap();

		let first = backend.save(b"aaaa").await.unwrap();
		let second = backend.save(b"bbbb").await.unwrap();
		assert_ne!(first, second);

		assert_eq!(backend.read(&first).await.unwrap(), b"aaaa");
		assert_eq!(backend.read(&second).await.unwrap(), b"bbbb");

		let mut uids = backend.get_all_blob_uids(None).await.unwrap();
		uids.sort();
		let mut expect = vec![first, second];
		expect.sort();
		assert_eq!(uids, expect);
	}

	#[tokio::test]
	async fn reopening_rebuilds_the_index() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let path = tmp.to_path_buf();
		let uid = {
			let backend = LargefileBackend::open(path.clone(), 4, 16).unwrap();
			futures::executor::block_on(backend.save(b"abcd")).unwrap()
		};

		let backend = LargefileBackend::open(path, 4, 16).unwrap();
		assert_eq!(futures::executor::block_on(backend.read(&uid)).unwrap(), b"abcd");
	}
}
