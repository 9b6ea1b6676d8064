//! RBD-diff-style change hints: a top-level JSON array of
//! `{offset, length, exists}` extents, converted to affected
//! block-index sets.
use std::collections::HashSet;

use serde::Deserialize;

use backym_util::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint {
	pub offset: u64,
	pub length: u64,
	pub exists: bool,
}

/// `exists` is accepted both as a JSON boolean and as the legacy JSON
/// string encoding `"true"`/`"false"` that `rbd diff --format=json`
/// has historically emitted.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExistsField {
	Bool(bool),
	Text(String),
}

impl ExistsField {
	fn into_bool(self) -> Result<bool, Error> {
		match self {
			ExistsField::Bool(b) => Ok(b),
			ExistsField::Text(s) if s == "true" => Ok(true),
			ExistsField::Text(s) if s == "false" => Ok(false),
			ExistsField::Text(s) => Err(Error::Message(format!(
				"invalid hint \"exists\" value: {:?}",
				s
			))),
		}
	}
}

#[derive(Deserialize)]
struct RawHint {
	offset: u64,
	length: u64,
	exists: ExistsField,
}

/// Parse a hints document. `source_size` bounds every hint's
/// `offset + length`; a hint that exceeds it is rejected before any
/// are returned.
pub fn parse_hints(json: &str, source_size: u64) -> Result<Vec<Hint>, Error> {
	let raw: Vec<RawHint> =
		serde_json::from_str(json).map_err(|e| Error::InvalidHints(format!("malformed hints document: {}", e)))?;

	let mut hints = Vec::with_capacity(raw.len());
	for r in raw {
		let end = r
			.offset
			.checked_add(r.length)
			.ok_or_else(|| Error::InvalidHints(format!("hint offset {} + length {} overflows", r.offset, r.length)))?;
		if end > source_size {
			return Err(Error::InvalidHints(format!(
				"hint [{}, {}) exceeds source size {}",
				r.offset, end, source_size
			)));
		}
		hints.push(Hint {
			offset: r.offset,
			length: r.length,
			exists: r.exists.into_bool()?,
		});
	}
	Ok(hints)
}

/// Block indices touched by `hints`, merging overlaps and absorbing
/// duplicates via the `HashSet`.
pub fn blocks_from_hints<'a>(hints: impl Iterator<Item = &'a Hint>, block_size: u64) -> HashSet<u64> {
	let mut blocks = HashSet::new();
	for h in hints {
		let start_block = h.offset / block_size;
		let end_block = (h.offset + h.length + block_size - 1) / block_size;
		for id in start_block..end_block {
			blocks.insert(id);
		}
	}
	blocks
}

#[cfg(test)]
mod tests {
	use super::*;

	const B: u64 = 4;

	#[test]
	fn parses_boolean_and_legacy_string_exists() {
		let json = r#"[{"offset":0,"length":4,"exists":true},{"offset":4,"length":4,"exists":"false"}]"#;
		let hints = parse_hints(json, 8).unwrap();
		assert_eq!(hints.len(), 2);
		assert!(hints[0].exists);
		assert!(!hints[1].exists);
	}

	#[test]
	fn rejects_a_hint_exceeding_source_size() {
		let json = r#"[{"offset":4,"length":8,"exists":true}]"#;
		assert!(parse_hints(json, 8).is_err());
	}

	#[test]
	fn rejects_an_overflowing_offset_length_pair() {
		let json = format!(r#"[{{"offset":{},"length":{},"exists":true}}]"#, u64::MAX, 10);
		assert!(parse_hints(&json, u64::MAX).is_err());
	}

	#[test]
	fn single_block_hint_marks_only_that_block() {
		let hints = vec![Hint { offset: 0, length: B - 1, exists: true }];
		assert_eq!(blocks_from_hints(hints.iter(), B), [0].into_iter().collect());
	}

	#[test]
	fn straddling_hint_marks_both_blocks() {
		let hints = vec![Hint { offset: B - 1, length: 2, exists: true }];
		assert_eq!(blocks_from_hints(hints.iter(), B), [0, 1].into_iter().collect());
	}

	#[test]
	fn overlapping_hints_merge_into_one_set() {
		let hints = vec![
			Hint { offset: 0, length: B, exists: true },
			Hint { offset: 0, length: B * 2, exists: true },
		];
		assert_eq!(blocks_from_hints(hints.iter(), B), [0, 1].into_iter().collect());
	}
}
