//! Line-oriented textual export/import of a version and its blocks
//! (`§6`).
use std::io::{BufRead, Write};

use backym_util::error::Error;
use backym_util::time::{format_dump, parse_dump};

use crate::model::{Block, Version};

pub const METADATA_VERSION: u32 = 1;

pub fn write_version(sink: &mut dyn Write, version: &Version, blocks: &[Block]) -> Result<(), Error> {
	writeln!(sink, "backy2 Version {} metadata dump", METADATA_VERSION)?;
	writeln!(
		sink,
		"{}, {}, {}, {}, {}, {}",
		version.uid,
		format_dump(&version.date),
		version.name,
		version.size,
		version.size_bytes,
		version.valid as u8,
	)?;
	for b in blocks {
		writeln!(
			sink,
			"{}, {}, {}, {}, {}, {}, {}",
			b.uid.as_deref().unwrap_or(""),
			b.version_uid,
			b.id,
			format_dump(&b.date),
			b.checksum.as_deref().unwrap_or(""),
			b.size,
			b.valid as u8,
		)?;
	}
	Ok(())
}

pub fn read_version(source: &mut dyn BufRead) -> Result<(Version, Vec<Block>), Error> {
	let mut lines = source.lines();

	let header = lines
		.next()
		.ok_or_else(|| Error::Message("empty metadata dump".into()))??;
	if !header.starts_with("backy2 Version ") {
		return Err(Error::Message(format!(
			"not a metadata dump (bad header: {:?})",
			header
		)));
	}

	let version_line = lines
		.next()
		.ok_or_else(|| Error::Message("metadata dump missing version line".into()))??;
	let fields: Vec<&str> = version_line.split(", ").collect();
	if fields.len() != 6 {
		return Err(Error::Message("malformed version line".into()));
	}
	let version = Version {
		uid: fields[0].to_string(),
		date: parse_dump(fields[1])
			.ok_or_else(|| Error::Message("malformed version date".into()))?,
		name: fields[2].to_string(),
		size: fields[3]
			.parse()
			.map_err(|_| Error::Message("malformed version size".into()))?,
		size_bytes: fields[4]
			.parse()
			.map_err(|_| Error::Message("malformed version size_bytes".into()))?,
		valid: fields[5] != "0",
	};

	let mut blocks = Vec::new();
	for line in lines {
		let line = line?;
		if line.is_empty() {
			continue;
		}
		let fields: Vec<&str> = line.split(", ").collect();
		if fields.len() != 7 {
			return Err(Error::Message("malformed block line".into()));
		}
		blocks.push(Block {
			uid: if fields[0].is_empty() {
				None
			} else {
				Some(fields[0].to_string())
			},
			version_uid: fields[1].to_string(),
			id: fields[2]
				.parse()
				.map_err(|_| Error::Message("malformed block id".into()))?,
			date: parse_dump(fields[3])
				.ok_or_else(|| Error::Message("malformed block date".into()))?,
			checksum: if fields[4].is_empty() {
				None
			} else {
				Some(fields[4].to_string())
			},
			size: fields[5]
				.parse()
				.map_err(|_| Error::Message("malformed block size".into()))?,
			valid: fields[6] != "0",
		});
	}

	Ok((version, blocks))
}
