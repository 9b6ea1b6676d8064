use backym_meta::{Stats, Version};
use backym_util::formater::format_table;
use backym_util::time::format_dump;

pub fn print_version_list(versions: &[(Version, Option<Stats>)]) {
	let mut rows = vec!["uid\tname\tdate\tsize\tsize_bytes\tvalid".to_string()];
	for (v, _) in versions {
		rows.push(format!(
			"{}\t{}\t{}\t{}\t{}\t{}",
			v.uid,
			v.name,
			format_dump(&v.date),
			v.size,
			bytesize::ByteSize::b(v.size_bytes).to_string_as(true),
			v.valid,
		));
	}
	format_table(rows);

	for (v, stats) in versions {
		if let Some(s) = stats {
			println!(
				"\n{}: read {} ({} blocks), written {} ({} blocks), dedup {} ({} blocks), sparse {} ({} blocks), {}s",
				v.uid,
				bytesize::ByteSize::b(s.bytes_read).to_string_as(true),
				s.blocks_read,
				bytesize::ByteSize::b(s.bytes_written).to_string_as(true),
				s.blocks_written,
				bytesize::ByteSize::b(s.bytes_found_dedup).to_string_as(true),
				s.blocks_found_dedup,
				bytesize::ByteSize::b(s.bytes_sparse).to_string_as(true),
				s.blocks_sparse,
				s.duration_seconds,
			);
		}
	}
}
