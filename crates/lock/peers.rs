//! Process registration and peer-liveness detection, used by
//! `cleanup_full` to refuse running while another instance is up.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use backym_util::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
	pub pid: u32,
	pub process_name: String,
	pub registered: DateTime<Local>,
}

/// A live process's registration file. Removed on drop, so a clean
/// shutdown leaves no trace; a crash leaves a stale file whose PID is
/// no longer alive, which peer detection treats as absent.
pub struct ProcessRegistration {
	path: PathBuf,
}

impl ProcessRegistration {
	pub fn register(dir: &Path, process_name: &str) -> Result<Self, Error> {
		std::fs::create_dir_all(dir)?;
		let pid = std::process::id();
		let path = dir.join(format!("process-{}.json", pid));
		let info = PeerInfo {
			pid,
			process_name: process_name.to_string(),
			registered: Local::now(),
		};
		std::fs::write(&path, serde_json::to_vec(&info)?)?;
		Ok(Self { path })
	}
}

impl Drop for ProcessRegistration {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

pub fn list_peers(dir: &Path) -> Result<Vec<PeerInfo>, Error> {
	let mut peers = Vec::new();
	let entries = match std::fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(peers),
		Err(e) => return Err(e.into()),
	};
	for entry in entries {
		let entry = entry?;
		let name = entry.file_name();
		let name = name.to_string_lossy();
		if !name.starts_with("process-") || !name.ends_with(".json") {
			continue;
		}
		let bytes = std::fs::read(entry.path())?;
		if let Ok(info) = serde_json::from_slice::<PeerInfo>(&bytes) {
			peers.push(info);
		}
	}
	Ok(peers)
}

/// Linux-specific liveness check: a PID is alive iff its `/proc`
/// entry exists.
pub fn is_alive(pid: u32) -> bool {
	Path::new("/proc").join(pid.to_string()).exists()
}

/// Error if any registered peer other than `self_pid` is still alive.
pub fn refuse_if_peer_alive(dir: &Path, self_pid: u32) -> Result<(), Error> {
	for peer in list_peers(dir)? {
		if peer.pid != self_pid && is_alive(peer.pid) {
			return Err(Error::Locked(format!(
				"peer process {} (pid {}) is still running",
				peer.process_name, peer.pid
			)));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn self_registration_is_visible_but_excluded_by_caller() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let _reg = ProcessRegistration::register(&dir, "host:123").unwrap();

		let peers = list_peers(&dir).unwrap();
		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].pid, std::process::id());

		// The only registered peer is this process itself, which is
		// alive, but refuse_if_peer_alive excludes self_pid.
		assert!(refuse_if_peer_alive(&dir, std::process::id()).is_ok());
	}

	#[test]
	fn a_stale_registration_from_a_dead_pid_is_ignored() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let info = PeerInfo {
			pid: 999_999, // exceedingly unlikely to be a live pid
			process_name: "stale:1".to_string(),
			registered: Local::now(),
		};
		std::fs::write(
			dir.join(format!("process-{}.json", info.pid)),
			serde_json::to_vec(&info).unwrap(),
		)
		.unwrap();

		assert!(refuse_if_peer_alive(&dir, std::process::id()).is_ok());
	}

	#[test]
	fn registration_file_is_removed_on_drop() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		{
			let _reg = ProcessRegistration::register(&dir, "host:123").unwrap();
			assert_eq!(list_peers(&dir).unwrap().len(), 1);
		}
		assert_eq!(list_peers(&dir).unwrap().len(), 0);
	}
}
