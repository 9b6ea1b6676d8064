//! Sharded filesystem blob store: one regular file per blob, addressed
//! by the first `DEPTH` pairs of hex characters of its uid.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use backym_util::error::{Error, Result};

use crate::{mint_uid, not_found, DataBackend};

const DEPTH: usize = 2;
const SPLIT: usize = 2;

pub struct FilesBackend {
	data_dir: PathBuf,
}

impl FilesBackend {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn blob_dir(&self, uid: &str) -> PathBuf {
		let mut path = self.data_dir.clone();
		for level in 0..DEPTH {
			let start = level * SPLIT;
			path.push(&uid[start..start + SPLIT]);
		}
		path
	}

	fn blob_path(&self, uid: &str) -> PathBuf {
		let mut path = self.blob_dir(uid);
		path.push(uid);
		path
	}
}

#[async_trait]
impl DataBackend for FilesBackend {
	async fn save(&self, data: &[u8]) -> Result<String> {
		loop {
			let uid = mint_uid();
			let path = self.blob_path(&uid);
			if fs::metadata(&path).await.is_ok() {
				// uid collision against an existing blob: mint a fresh one.
				continue;
			}

			let dir = self.blob_dir(&uid);
			fs::create_dir_all(&dir).await?;

			let mut tmp_path = path.clone();
			let suffix = format!("tmp{}", hex::encode(rand::thread_rng().gen::<[u8; 4]>()));
			tmp_path.set_extension(suffix);

			let mut delete_on_drop = DeleteOnDrop(Some(tmp_path.clone()));
			let mut f = fs::File::create(&tmp_path).await?;
			f.write_all(data).await?;
			f.sync_all().await?;
			drop(f);

			fs::rename(&tmp_path, &path).await?;
			delete_on_drop.cancel();

			fsync_dir(&dir).await?;

			return Ok(uid);
		}
	}

	async fn read(&self, uid: &str) -> Result<Vec<u8>> {
		let path = self.blob_path(uid);
		fs::read(&path).await.map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				not_found(uid)
			} else {
				Error::Io(e)
			}
		})
	}

	async fn rm(&self, uid: &str) -> Result<()> {
		let path = self.blob_path(uid);
		match fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(Error::Io(e)),
		}
	}

	async fn get_all_blob_uids(&self, prefix: Option<&str>) -> Result<Vec<String>> {
		let mut uids = Vec::new();
		let mut stack = vec![fs::read_dir(&self.data_dir).await?];
		while let Some(reader) = stack.last_mut() {
			match reader.next_entry().await? {
				Some(ent) => {
					let name = match ent.file_name().into_string() {
						Ok(n) => n,
						Err(_) => continue,
					};
					let file_type = ent.file_type().await?;
					if file_type.is_dir() && name.len() == SPLIT && hex::decode(&name).is_ok() {
						stack.push(fs::read_dir(ent.path()).await?);
					} else if file_type.is_file() && name.len() == 32 && hex::decode(&name).is_ok()
					{
						if prefix.map(|p| name.starts_with(p)).unwrap_or(true) {
							uids.push(name);
						}
					}
				}
				None => {
					stack.pop();
				}
			}
		}
		Ok(uids)
	}
}

async fn fsync_dir(dir: &Path) -> Result<()> {
	let d = fs::File::open(dir).await?;
	d.sync_all().await?;
	Ok(())
}

struct DeleteOnDrop(Option<PathBuf>);

impl DeleteOnDrop {
	fn cancel(&mut self) {
		self.0 = None;
	}
}

impl Drop for DeleteOnDrop {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			let _ = std::fs::remove_file(path);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn save_read_rm_round_trips() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let backend = FilesBackend::new(tmp.to_path_buf());

		let uid = backend.save(b"hello world").await.unwrap();
		assert_eq!(backend.read(&uid).await.unwrap(), b"hello world");

		let uids = backend.get_all_blob_uids(None).await.unwrap();
		assert_eq!(uids, vec![uid.clone()]);

		backend.rm(&uid).await.unwrap();
		assert!(backend.read(&uid).await.is_err());
		// removing twice is not an error
		backend.rm(&uid).await.unwrap();
	}

	#[tokio::test]
	async fn distinct_blobs_get_distinct_uids() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let backend = FilesBackend::new(tmp.to_path_buf());
		let a = backend.save(b"same content").await.unwrap();
		let b = backend.save(b"same content").await.unwrap();
		assert_ne!(a, b, "uid minting must not be content-derived");
	}
}
