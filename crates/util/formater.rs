//! Minimal tab-aligned table printer used by the CLI's `ls` output.
//!
//! Each input line is a single string with fields separated by `\t`;
//! columns are padded to the width of their widest cell and printed
//! space-separated, mirroring a typical Unix `column -t`.

pub fn format_table(rows: Vec<String>) {
	print!("{}", format_table_to_string(rows));
}

pub fn format_table_to_string(rows: Vec<String>) -> String {
	let splitrows = rows
		.iter()
		.map(|s| s.split('\t').collect::<Vec<_>>())
		.collect::<Vec<_>>();

	let ncols = splitrows.iter().map(|r| r.len()).max().unwrap_or(0);
	let mut colwidth = vec![0; ncols];
	for row in splitrows.iter() {
		for (i, cell) in row.iter().enumerate() {
			colwidth[i] = colwidth[i].max(cell.chars().count());
		}
	}

	let mut out = String::new();
	for row in splitrows.iter() {
		for (i, cell) in row.iter().enumerate() {
			if i > 0 {
				out.push(' ');
			}
			if i + 1 < row.len() {
				out.push_str(&format!("{:width$}", cell, width = colwidth[i]));
			} else {
				out.push_str(cell);
			}
		}
		out.push('\n');
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn aligns_columns() {
		let rows = vec!["a\tbb\tccc".to_string(), "aaaa\tb\tc".to_string()];
		let out = format_table_to_string(rows);
		let lines: Vec<_> = out.lines().collect();
		assert_eq!(lines[0], "a    bb ccc");
		assert_eq!(lines[1], "aaaa b  c");
	}
}
