use std::path::PathBuf;

use structopt::StructOpt;

use backym_engine::hints::parse_hints;
use backym_engine::Engine;
use backym_util::error::Error;

use crate::table::print_version_list;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Back up a source device or image into a new version
	#[structopt(name = "backup")]
	Backup(BackupOpt),

	/// Restore a version to a target device or image
	#[structopt(name = "restore")]
	Restore(RestoreOpt),

	/// Verify stored blocks against their recorded checksum
	#[structopt(name = "scrub")]
	Scrub(ScrubOpt),

	/// Remove a version and its block rows
	#[structopt(name = "rm")]
	Rm(RmOpt),

	/// Reclaim blobs no longer referenced by any version
	#[structopt(name = "cleanup")]
	Cleanup(CleanupOpt),

	/// List versions
	#[structopt(name = "ls")]
	Ls(LsOpt),

	/// Write a version's metadata to a file (or stdout)
	#[structopt(name = "export")]
	Export(ExportOpt),

	/// Read a version's metadata from a file (or stdin)
	#[structopt(name = "import")]
	Import(ImportOpt),
}

#[derive(StructOpt, Debug)]
pub struct BackupOpt {
	/// Name to record the new version under
	pub name: String,

	/// Source URL, currently only file:// is implemented
	#[structopt(long = "source")]
	pub source: String,

	/// Path to an RBD-diff-style JSON hints file
	#[structopt(long = "hints")]
	pub hints: Option<PathBuf>,

	/// uid of the version this backup is incremental against
	#[structopt(long = "from")]
	pub from_version: Option<String>,
}

#[derive(StructOpt, Debug)]
pub struct RestoreOpt {
	/// uid of the version to restore
	pub version_uid: String,

	/// Target URL, currently only file:// is implemented
	#[structopt(long = "target")]
	pub target: String,

	/// Leave holes in the target instead of zero-filling sparse blocks
	#[structopt(long = "sparse")]
	pub sparse: bool,

	/// Overwrite an existing regular file at the target
	#[structopt(long = "force")]
	pub force: bool,
}

#[derive(StructOpt, Debug)]
pub struct ScrubOpt {
	/// uid of the version to scrub
	pub version_uid: String,

	/// Also compare stored blocks against this still-available source
	#[structopt(long = "source")]
	pub source: Option<String>,

	/// Percentage of non-sparse blocks to sample, 1-100
	#[structopt(long = "percentile", default_value = "100")]
	pub percentile: u8,
}

#[derive(StructOpt, Debug)]
pub struct RmOpt {
	/// uid of the version to remove
	pub version_uid: String,

	/// Skip the minimum-age guard
	#[structopt(long = "force")]
	pub force: bool,

	/// Refuse to remove a version younger than this, in days
	#[structopt(long = "min-age-days", default_value = "0")]
	pub min_age_days: i64,
}

#[derive(StructOpt, Debug)]
pub struct CleanupOpt {
	#[structopt(subcommand)]
	pub what: CleanupWhat,
}

#[derive(StructOpt, Debug)]
pub enum CleanupWhat {
	/// Harvest zero-refcount blobs past their grace period
	#[structopt(name = "fast")]
	Fast {
		/// Minimum age, in seconds, since a blob's refcount reached zero
		#[structopt(long = "grace-seconds", default_value = "3600")]
		grace_seconds: i64,
	},
	/// Scan the full data backend for blobs with no metadata reference
	#[structopt(name = "full")]
	Full {
		/// Only consider blob uids with this textual prefix
		#[structopt(long = "prefix")]
		prefix: Option<String>,
	},
}

#[derive(StructOpt, Debug)]
pub struct LsOpt {
	/// Only list versions with this exact name
	pub name: Option<String>,

	/// Include per-version backup statistics
	#[structopt(long = "stats")]
	pub stats: bool,
}

#[derive(StructOpt, Debug)]
pub struct ExportOpt {
	/// uid of the version to export
	pub version_uid: String,

	/// Destination file; defaults to stdout
	#[structopt(long = "output")]
	pub output: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct ImportOpt {
	/// Source file; defaults to stdin
	#[structopt(long = "input")]
	pub input: Option<PathBuf>,
}

pub async fn run_command(engine: &Engine, cmd: Command) -> Result<(), Error> {
	match cmd {
		Command::Backup(opt) => cmd_backup(engine, opt).await,
		Command::Restore(opt) => cmd_restore(engine, opt).await,
		Command::Scrub(opt) => cmd_scrub(engine, opt).await,
		Command::Rm(opt) => cmd_rm(engine, opt),
		Command::Cleanup(opt) => cmd_cleanup(engine, opt).await,
		Command::Ls(opt) => cmd_ls(engine, opt),
		Command::Export(opt) => cmd_export(engine, opt),
		Command::Import(opt) => cmd_import(engine, opt),
	}
}

async fn cmd_backup(engine: &Engine, opt: BackupOpt) -> Result<(), Error> {
	let hints = match &opt.hints {
		Some(path) => {
			let json = std::fs::read_to_string(path)?;
			// source size is only known once backym_io opens the
			// source; parse without a bound here and let the engine
			// re-validate against the real size.
			Some(parse_hints(&json, u64::MAX)?)
		}
		None => None,
	};

	let uid = engine
		.backup(&opt.name, &opt.source, hints, opt.from_version.as_deref())
		.await?;
	println!("{}", uid);
	Ok(())
}

async fn cmd_restore(engine: &Engine, opt: RestoreOpt) -> Result<(), Error> {
	engine
		.restore(&opt.version_uid, &opt.target, opt.sparse, opt.force)
		.await
}

async fn cmd_scrub(engine: &Engine, opt: ScrubOpt) -> Result<(), Error> {
	let ok = engine
		.scrub(&opt.version_uid, opt.source.as_deref(), opt.percentile)
		.await?;
	if ok {
		println!("{}: OK", opt.version_uid);
		Ok(())
	} else {
		println!("{}: CORRUPT", opt.version_uid);
		Err(Error::ChecksumMismatch(opt.version_uid))
	}
}

fn cmd_rm(engine: &Engine, opt: RmOpt) -> Result<(), Error> {
	engine.rm(&opt.version_uid, opt.force, opt.min_age_days)
}

async fn cmd_cleanup(engine: &Engine, opt: CleanupOpt) -> Result<(), Error> {
	match opt.what {
		CleanupWhat::Fast { grace_seconds } => {
			let removed = engine.cleanup_fast(grace_seconds).await?;
			println!("removed {} blob(s)", removed);
		}
		CleanupWhat::Full { prefix } => {
			let removed = engine.cleanup_full(prefix.as_deref()).await?;
			println!("removed {} orphaned blob(s)", removed);
		}
	}
	Ok(())
}

fn cmd_ls(engine: &Engine, opt: LsOpt) -> Result<(), Error> {
	let versions = engine.ls(opt.name.as_deref(), opt.stats)?;
	print_version_list(&versions);
	Ok(())
}

fn cmd_export(engine: &Engine, opt: ExportOpt) -> Result<(), Error> {
	match opt.output {
		Some(path) => {
			let mut f = std::fs::File::create(path)?;
			engine.export(&opt.version_uid, &mut f)
		}
		None => {
			let mut out = std::io::stdout();
			engine.export(&opt.version_uid, &mut out)
		}
	}
}

fn cmd_import(engine: &Engine, opt: ImportOpt) -> Result<(), Error> {
	let uid = match opt.input {
		Some(path) => {
			let mut f = std::io::BufReader::new(std::fs::File::open(path)?);
			engine.import(&mut f)?
		}
		None => {
			let stdin = std::io::stdin();
			let mut lock = stdin.lock();
			engine.import(&mut lock)?
		}
	};
	println!("{}", uid);
	Ok(())
}
