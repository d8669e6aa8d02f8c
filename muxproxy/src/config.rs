//! Server configuration, parsed from command-line arguments.

use std::path::PathBuf;

use pico_args::{Arguments, Error as ArgsError};

/// The route file used when `--config` is not given, relative to the
/// user's home directory
pub const DEFAULT_ROUTE_FILE: &str = ".socks-routes";

/// The addresses listened on when no `--listen` is given
pub const DEFAULT_LISTEN: [&str; 2] = ["127.0.0.1:8000", "[::1]:8000"];

/// Parsed server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// Whether debug-level logging is enabled (`--debug`)
	pub debug: bool,
	/// The route file path (`--config`, default `~/.socks-routes`)
	pub route_file: PathBuf,
	/// The TCP addresses to accept proxy connections on (`--listen`,
	/// repeatable)
	pub listen: Vec<String>,
}

impl Config {
	/// Parse the configuration from command-line arguments.
	///
	/// # Errors
	/// Returns an error for malformed argument values. Unknown arguments
	/// are left in `args` for the caller to reject.
	pub fn from_args(args: &mut Arguments) -> Result<Self, ArgsError> {
		let debug = args.contains("--debug");
		let route_file = args
			.opt_value_from_str::<_, PathBuf>("--config")?
			.unwrap_or_else(default_route_file);
		let mut listen: Vec<String> = args.values_from_str("--listen")?;
		if listen.is_empty() {
			listen = DEFAULT_LISTEN.map(str::to_string).into();
		}

		Ok(Self {
			debug,
			route_file,
			listen,
		})
	}
}

/// `~/.socks-routes`, falling back to the bare file name if the home
/// directory can not be determined
fn default_route_file() -> PathBuf {
	dirs::home_dir()
		.unwrap_or_default()
		.join(DEFAULT_ROUTE_FILE)
}
