//! Ambient stack shared by every other crate in this workspace:
//! configuration, the crate-wide error type, content hashing, time
//! formatting, background worker pools and the CLI table printer.

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod formater;
pub mod time;

pub use error::{Error, Result};

/// Build identifier shown by `backym --version`, baked in at compile time.
pub static VERSION: &str = git_version::git_version!(
	prefix = "backym ",
	fallback = "unknown"
);
