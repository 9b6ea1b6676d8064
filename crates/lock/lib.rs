//! Advisory, file-backed locks keyed by a symbolic name, plus
//! process registration so that `cleanup_full` can refuse to run
//! while a peer instance is alive.
//!
//! A lock is a regular file created with `O_CREAT|O_EXCL` semantics:
//! acquisition is a single atomic filesystem operation, never a
//! blocking wait. `unlock` removes the file.

pub mod peers;

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use backym_util::error::Error;

pub use peers::{is_alive, ProcessRegistration};

/// Name of the global exclusivity gate lock.
pub const GLOBAL_LOCK: &str = "backy";
/// Name of the lock held for the duration of a fast cleanup run.
pub const CLEANUP_FAST_LOCK: &str = "backy-cleanup-fast";

pub struct LockManager {
	dir: PathBuf,
	process_name: String,
	held: Mutex<HashSet<String>>,
}

/// Released automatically on drop, so a lock taken at the start of an
/// operation is always released on every exit path, including a
/// panicking or early-returning one.
pub struct LockGuard<'a> {
	manager: &'a LockManager,
	name: String,
}

impl Drop for LockGuard<'_> {
	fn drop(&mut self) {
		if let Err(e) = self.manager.unlock(&self.name) {
			tracing::warn!(lock = %self.name, error = %e, "failed to release lock");
		}
	}
}

impl LockManager {
	pub fn new(dir: PathBuf, process_name: String) -> Result<Self, Error> {
		std::fs::create_dir_all(&dir)?;
		Ok(Self {
			dir,
			process_name,
			held: Mutex::new(HashSet::new()),
		})
	}

	fn lock_path(&self, name: &str) -> PathBuf {
		self.dir.join(format!("{}.lock", name))
	}

	/// Attempt non-blocking acquisition. Returns `false` immediately
	/// on contention, never blocks.
	pub fn lock(&self, name: &str) -> Result<bool, Error> {
		let path = self.lock_path(name);
		match OpenOptions::new().write(true).create_new(true).open(&path) {
			Ok(mut f) => {
				writeln!(f, "{}\n{}", std::process::id(), self.process_name)?;
				self.held.lock().unwrap().insert(name.to_string());
				tracing::debug!(lock = name, "acquired");
				Ok(true)
			}
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Acquire `name`, returning a guard that releases it on drop, or
	/// `None` if another holder has it.
	pub fn acquire(&self, name: &str) -> Result<Option<LockGuard<'_>>, Error> {
		if self.lock(name)? {
			Ok(Some(LockGuard {
				manager: self,
				name: name.to_string(),
			}))
		} else {
			Ok(None)
		}
	}

	pub fn unlock(&self, name: &str) -> Result<(), Error> {
		let path = self.lock_path(name);
		match std::fs::remove_file(&path) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		self.held.lock().unwrap().remove(name);
		Ok(())
	}

	pub fn is_locked(&self, name: &str) -> bool {
		self.lock_path(name).exists()
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn process_name(&self) -> &str {
		&self.process_name
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager() -> LockManager {
		let tmp = mktemp::Temp::new_dir().unwrap();
		LockManager::new(tmp.to_path_buf(), "test:1".to_string()).unwrap()
	}

	#[test]
	fn second_lock_on_a_held_name_fails_without_blocking() {
		let m = manager();
		assert!(m.lock("backy").unwrap());
		assert!(!m.lock("backy").unwrap());
		m.unlock("backy").unwrap();
		assert!(m.lock("backy").unwrap());
	}

	#[test]
	fn distinct_names_do_not_contend() {
		let m = manager();
		assert!(m.lock("v1").unwrap());
		assert!(m.lock("v2").unwrap());
	}

	#[test]
	fn guard_releases_the_lock_on_drop() {
		let m = manager();
		{
			let guard = m.acquire("backy").unwrap();
			assert!(guard.is_some());
			assert!(m.is_locked("backy"));
		}
		assert!(!m.is_locked("backy"));
	}

	#[test]
	fn acquire_returns_none_on_contention() {
		let m = manager();
		let _first = m.acquire("backy").unwrap().unwrap();
		assert!(m.acquire("backy").unwrap().is_none());
	}
}
