//! Time helpers shared by the meta backend and the CLI's table output.
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

/// Format matching the metadata export/import textual dump (`§6`):
/// `YYYY-MM-DD HH:MM:SS`.
pub const DUMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now() -> DateTime<Local> {
	Local::now()
}

pub fn format_dump(t: &DateTime<Local>) -> String {
	t.format(DUMP_FORMAT).to_string()
}

pub fn parse_dump(s: &str) -> Option<DateTime<Local>> {
	let naive = NaiveDateTime::parse_from_str(s, DUMP_FORMAT).ok()?;
	Local.from_local_datetime(&naive).single()
}

pub fn age_days(t: &DateTime<Local>) -> i64 {
	(Local::now() - *t).num_days()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn dump_format_round_trips() {
		let t = Local.ymd(2024, 3, 14).and_hms(1, 2, 3);
		let s = format_dump(&t);
		assert_eq!(s, "2024-03-14 01:02:03");
		assert_eq!(parse_dump(&s).unwrap(), t);
	}
}
