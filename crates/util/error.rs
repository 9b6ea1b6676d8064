//! Crate-wide error type for the backup engine and its collaborators.
use std::io;

use err_derive::Error;

/// The error type returned by every fallible operation in this workspace.
///
/// Each variant corresponds to one of the documented failure modes of the
/// engine; callers match on these to decide whether a fault is transient
/// (logged, operation continues) or structural (operation aborts).
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] io::Error),

	#[error(display = "Database error: {}", _0)]
	Db(#[error(source)] backym_db::Error),

	#[error(display = "TOML decode error: {}", _0)]
	TomlDecode(#[error(source)] toml::de::Error),

	#[error(display = "TOML encode error: {}", _0)]
	TomlEncode(#[error(source)] toml::ser::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),

	#[error(display = "{}", _0)]
	Message(String),

	/// Another holder of the same named lock prevents this operation.
	#[error(display = "Lock {} is held by another process", _0)]
	Locked(String),

	/// `from_version` passed to `prepare_version` is not valid.
	#[error(display = "Base version {} is not valid", _0)]
	InvalidBase(String),

	/// Hint offsets exceed the source's reported size.
	#[error(display = "Invalid hints: {}", _0)]
	InvalidHints(String),

	/// Sanity-check sample disagreed with a stored checksum during an
	/// incremental backup; the newly created version has been removed.
	#[error(display = "Hint sanity check failed on block {}", _0)]
	HintMismatch(u64),

	/// A referenced blob does not exist in the data backend.
	#[error(display = "Blob {} not found", _0)]
	NotFound(String),

	/// A blob's bytes do not hash to the checksum recorded for it.
	#[error(display = "Checksum mismatch for blob {}", _0)]
	ChecksumMismatch(String),

	/// Scrub-with-source found the source different from the stored blob,
	/// while the blob itself still matches its own checksum.
	#[error(display = "Source drifted from backed-up block {}", _0)]
	SourceDrift(u64),

	/// Number of dispatched reads did not equal number of completions.
	#[error(display = "IO pipeline broken: {}", _0)]
	PipelineBroken(String),

	/// `rm` refused by the minimum-age guard.
	#[error(display = "Version {} is too young to remove", _0)]
	TooYoung(String),

	/// A refcount invariant was violated (decrementing past zero).
	#[error(display = "Dangling refcount for blob {}", _0)]
	DanglingRefcount(String),

	/// Source/target URL is malformed or names an unregistered scheme.
	#[error(display = "Invalid URL {}: {}", _0, _1)]
	InvalidUrl(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<String> for Error {
	fn from(s: String) -> Error {
		Error::Message(s)
	}
}

impl From<&str> for Error {
	fn from(s: &str) -> Error {
		Error::Message(s.to_string())
	}
}

impl From<backym_db::TxOpError> for Error {
	fn from(e: backym_db::TxOpError) -> Error {
		Error::Message(format!("{}", e))
	}
}
