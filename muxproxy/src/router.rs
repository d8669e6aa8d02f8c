//! The routed dialer: route set lookup plus the actual outbound connect.
//!
//! Every handler funnels its outbound connections through [`Router::dial`],
//! which classifies the requested destination, finds the first matching
//! rule, logs the routing decision, and then connects either directly or
//! through the configured SOCKS5 upstream. Name resolution happens inside
//! whichever dialer connects (the OS for direct dials, the SOCKS5 server
//! for proxied ones), never in the router itself.

use std::{
	io::{Error as IoError, ErrorKind, Result as IoResult},
	net::SocketAddr,
	path::{Path, PathBuf},
};

use muxproxy_routemap::{Destination, ParseError, RouteSet, Upstream};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{error, info};

/// The error returned when the route file can not be loaded at startup.
#[derive(Debug, thiserror::Error)]
pub enum RouteFileError {
	/// The file could not be read at all
	#[error("couldn't read route file {path:?}: {source}")]
	Read {
		/// The path that was attempted
		path: PathBuf,
		/// The underlying I/O error
		source: IoError,
	},
	/// The file was read but one of its lines is not a valid route
	#[error(transparent)]
	Parse(#[from] ParseError),
}

/// A read-only route set bound to the dialers that execute its decisions.
#[derive(Debug)]
pub struct Router {
	routes: RouteSet,
}

impl Router {
	/// Create a router over an already-parsed route set
	#[must_use]
	pub fn new(routes: RouteSet) -> Self {
		Self { routes }
	}

	/// Load and parse a route file.
	///
	/// # Errors
	/// Returns a [`RouteFileError`] if the file can not be read or any line
	/// can not be parsed. Both are considered fatal by the server binary.
	pub fn from_file(path: &Path) -> Result<Self, RouteFileError> {
		let input = std::fs::read_to_string(path).map_err(|source| RouteFileError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Ok(Self::new(RouteSet::parse(&input)?))
	}

	/// The route set this router consults
	#[must_use]
	pub fn routes(&self) -> &RouteSet {
		&self.routes
	}

	/// Open a TCP connection to `address` (`host:port`), honoring the route
	/// set. The routing decision is logged on the access log; dial failures
	/// are logged and returned unchanged.
	///
	/// # Errors
	/// Returns an error if the address can not be parsed as `host:port`, or
	/// if the chosen dialer fails to connect.
	pub async fn dial(&self, address: &str) -> IoResult<TcpStream> {
		let dest = Destination::parse(address)
			.map_err(|err| IoError::new(ErrorKind::InvalidInput, err))?;

		let upstream = self
			.routes
			.lookup(&dest)
			.map_or(&Upstream::Direct, |rule| rule.upstream());

		let desc = match upstream {
			Upstream::Direct => format!("directly to {address}"),
			Upstream::Socks5(_) => format!("to {address} over {}", upstream.name()),
		};
		info!(target: "access", "connecting {desc}");

		let conn = match upstream {
			Upstream::Direct => TcpStream::connect(address).await,
			Upstream::Socks5(proxy) => dial_socks5(proxy, &dest).await,
		};

		match conn {
			Ok(conn) => Ok(conn),
			Err(err) => {
				error!("failed to connect {desc}: {err}");
				Err(err)
			}
		}
	}
}

/// Connect to `dest` through the SOCKS5 server at `proxy`, with no
/// authentication. The destination is passed to the proxy as requested: IP
/// literals as addresses, names as names.
async fn dial_socks5(proxy: &str, dest: &Destination) -> IoResult<TcpStream> {
	let port = dest
		.port()
		.parse::<u16>()
		.map_err(|err| IoError::new(ErrorKind::InvalidInput, err))?;

	let stream = if let Some(ip) = dest.ip() {
		Socks5Stream::connect(proxy, SocketAddr::new(ip, port)).await
	} else {
		Socks5Stream::connect(proxy, (dest.domain().to_string(), port)).await
	};

	stream
		.map(Socks5Stream::into_inner)
		.map_err(|err| match err {
			tokio_socks::Error::Io(io) => io,
			// keep the proxy's reply wording; SOCKS5 code mapping reads it
			other => IoError::new(ErrorKind::Other, other.to_string()),
		})
}
