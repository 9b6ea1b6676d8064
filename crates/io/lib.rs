//! Pipelined reader/writer over a `file://` source or target, with
//! background workers that compute the content hash as soon as data
//! is in hand. The engine receives `(block, data, checksum)` triples
//! and never re-hashes.

pub mod source;
pub mod target;

pub use source::Source;
pub use target::Target;

use std::path::PathBuf;

use backym_util::error::Error;

/// Identity of a block within a read/write session. Carried alongside
/// each completion so that out-of-order reads remain attributable.
pub type BlockRef = u64;

/// One finished read: the block it was issued for, its bytes, and
/// their checksum.
pub type Completion = (BlockRef, Vec<u8>, String);

/// Only the `file://` scheme is implemented; the shape of this
/// function is the registry other schemes would extend.
pub fn parse_file_url(url: &str) -> Result<PathBuf, Error> {
	if url.contains('?') || url.contains('#') {
		return Err(Error::InvalidUrl(
			url.to_string(),
			"query and fragment are not supported".into(),
		));
	}
	let (scheme, rest) = url
		.split_once("://")
		.ok_or_else(|| Error::InvalidUrl(url.to_string(), "missing scheme".into()))?;
	if scheme != "file" {
		return Err(Error::InvalidUrl(
			url.to_string(),
			format!("unsupported scheme {:?}, only file:// is implemented", scheme),
		));
	}
	if rest.is_empty() {
		return Err(Error::InvalidUrl(url.to_string(), "empty path".into()));
	}
	Ok(PathBuf::from(rest))
}

/// Length in bytes of the block at `offset` given a total size of
/// `size_bytes`; 0 past end of file, `block_size` everywhere except
/// possibly the final block.
pub(crate) fn block_len(offset: u64, block_size: u64, size_bytes: u64) -> u64 {
	if offset >= size_bytes {
		0
	} else {
		std::cmp::min(block_size, size_bytes - offset)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_file_url() {
		assert_eq!(parse_file_url("file:///tmp/disk.img").unwrap(), PathBuf::from("/tmp/disk.img"));
	}

	#[test]
	fn rejects_other_schemes() {
		assert!(parse_file_url("rbd://pool/image").is_err());
	}

	#[test]
	fn rejects_query_and_fragment() {
		assert!(parse_file_url("file:///tmp/disk.img?snap=1").is_err());
		assert!(parse_file_url("file:///tmp/disk.img#frag").is_err());
	}

	#[test]
	fn block_len_shrinks_on_the_final_block() {
		assert_eq!(block_len(0, 4, 10), 4);
		assert_eq!(block_len(4, 4, 10), 4);
		assert_eq!(block_len(8, 4, 10), 2);
		assert_eq!(block_len(12, 4, 10), 0);
	}
}
