//! `backym`: a deduplicating, content-addressed block-level backup
//! engine for virtual machine disks.

mod cli;
mod table;

use std::path::PathBuf;
use std::process::ExitCode;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use backym_engine::Engine;
use backym_util::config::read_config;
use backym_util::error::Error;

use cli::Command;

#[derive(StructOpt, Debug)]
#[structopt(name = "backym")]
struct Opt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "./backym.toml")]
	config_file: PathBuf,

	/// Raise log verbosity; repeat for more (-v, -vv)
	#[structopt(short = "v", parse(from_occurrences))]
	verbose: u8,

	#[structopt(subcommand)]
	command: Command,
}

fn init_tracing(verbose: u8) {
	let default_level = match verbose {
		0 => "backym=info",
		1 => "backym=debug,backym_engine=debug,backym_io=debug,backym_meta=debug,backym_lock=debug",
		_ => "debug",
	};
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
		.init();
}

/// Exit codes per the CLI surface: `0` success, `1` unexpected error,
/// `3` pipeline broken, `4` prepare error, `5` hint mismatch, `99`
/// lock contention.
fn exit_code_for(err: &Error) -> u8 {
	match err {
		Error::Locked(_) => 99,
		Error::InvalidBase(_) | Error::InvalidHints(_) => 4,
		Error::HintMismatch(_) => 5,
		Error::PipelineBroken(_) => 3,
		_ => 1,
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	let opt = Opt::from_args();
	init_tracing(opt.verbose);

	let result = run(opt).await;
	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(error = %e, "backym exited with an error");
			ExitCode::from(exit_code_for(&e))
		}
	}
}

async fn run(opt: Opt) -> Result<(), Error> {
	let config = read_config(opt.config_file)?;
	let engine = Engine::new(&config)?;
	cli::run_command(&engine, opt.command).await
}
