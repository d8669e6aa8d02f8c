//! Miscellaneous statics and help text used throughout muxproxy.

use lazy_static::lazy_static;

lazy_static! {
	/// A string representation of this crate's version. In debug builds, this
	/// is in the form of `[full semver crate version]+debug`. In release
	/// builds this gets shortened to `MAJOR.MINOR`.
	pub static ref VERSION: String = if cfg!(debug_assertions) {
		env!("CARGO_PKG_VERSION").to_string() + "+debug"
	} else {
		env!("CARGO_PKG_VERSION_MAJOR").to_string() + "." + env!("CARGO_PKG_VERSION_MINOR")
	};

	/// The name and version of this server, used in startup logs.
	pub static ref SERVER_NAME: String = format!("muxproxy/{}", &*VERSION);
}

/// Help string for the server CLI
pub const SERVER_HELP: &str = r#"muxproxy server

Accepts SOCKS4, SOCKS4a, SOCKS5, HTTP proxy, and HTTP CONNECT requests on
the same port(s) and routes each outbound connection per destination.

USAGE:
    server [FLAGS] [OPTIONS]

FLAGS (all default off):
 -h --help             Print this and exit
    --debug            Enable debug logging

OPTIONS:
    --config PATH      Path to the route file (default ~/.socks-routes)
    --listen ADDRESS   TCP address to bind the proxy to; may be given
                       multiple times (default 127.0.0.1:8000 and [::1]:8000)
"#;
