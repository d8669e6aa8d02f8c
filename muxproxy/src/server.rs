//! Listeners and the accept loop.
//!
//! One [`Listener`] exists per configured bind address. Each runs its own
//! accept loop task; every accepted connection is served by the shared
//! [`Multiplexer`] on its own task, so a misbehaving connection (or a
//! panicking handler) never affects its siblings or the accept loop.
//!
//! Transient accept errors are retried with exponential backoff starting at
//! 5 ms and capped at 1 s, resetting after every successful accept. Any
//! other accept error stops the server, which the binary treats as fatal.

use std::{
	io::{Error as IoError, ErrorKind},
	net::SocketAddr,
	os::raw::c_int,
	sync::Arc,
	time::Duration,
};

use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::{net::TcpListener, task::JoinSet, time::sleep};
use tracing::{debug, error};

use crate::{
	http::HttpDetector,
	mux::{Multiplexer, ProtocolDetector},
	router::Router,
	Error,
};

/// Number of incoming connections that can be kept in the TCP socket
/// backlog of a listener
const LISTENER_TCP_BACKLOG_SIZE: c_int = 1024;

/// Backoff bounds for transient accept errors
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The error returned when the server can not start.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
	/// A `--listen` value is not a socket address literal
	#[error("invalid listen address {0:?}: {1}")]
	Address(String, std::net::AddrParseError),
	/// The listening socket could not be set up
	#[error("failed to bind to address {0}: {1}")]
	Bind(SocketAddr, IoError),
}

/// Build the standard detector chain over `router`.
///
/// SOCKS is probed first because it needs only a single byte; HTTP needs a
/// whole request line.
#[must_use]
pub fn detectors(router: &Arc<Router>) -> Vec<Box<dyn ProtocolDetector>> {
	vec![
		Box::new(crate::socks::SocksDetector::new(Arc::clone(router))),
		Box::new(HttpDetector::new(Arc::clone(router))),
	]
}

/// A bound proxy server: one listening socket per configured address, all
/// feeding the same protocol multiplexer.
pub struct Server {
	mux: Arc<Multiplexer>,
	listeners: Vec<TcpListener>,
}

impl Server {
	/// Bind a listening socket on every address in `listen` and prepare the
	/// standard multiplexer over `router`.
	///
	/// # Errors
	/// Returns a [`BindError`] if any address is unparseable or can not be
	/// bound. Binding is all-or-nothing so that startup failures are loud.
	pub fn bind(listen: &[String], router: Arc<Router>) -> Result<Self, BindError> {
		let mux = Arc::new(Multiplexer::new(detectors(&router)));

		let listeners = listen
			.iter()
			.map(|addr| {
				let socket_addr = addr
					.parse::<SocketAddr>()
					.map_err(|err| BindError::Address(addr.clone(), err))?;
				bind_listener(socket_addr).map_err(|err| BindError::Bind(socket_addr, err))
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self { mux, listeners })
	}

	/// The addresses actually bound, in `--listen` order. With a port of 0
	/// these carry the kernel-assigned ports.
	#[must_use]
	pub fn local_addrs(&self) -> Vec<SocketAddr> {
		self.listeners
			.iter()
			.filter_map(|listener| listener.local_addr().ok())
			.collect()
	}

	/// Run every listener's accept loop until the first non-transient
	/// accept error. Dropping the returned future stops all loops.
	///
	/// # Errors
	/// Returns the accept error that stopped a listener.
	pub async fn run(self) -> Result<(), Error> {
		let mut loops = JoinSet::new();
		for listener in self.listeners {
			let mux = Arc::clone(&self.mux);
			loops.spawn(accept_loop(listener, mux));
		}

		while let Some(finished) = loops.join_next().await {
			match finished {
				Ok(result) => return result,
				// a panicking accept loop is a bug, but don't hide it
				Err(err) if err.is_panic() => {
					return Err(IoError::new(ErrorKind::Other, err.to_string()).into())
				}
				Err(_) => {}
			}
		}
		Ok(())
	}
}

/// Set up a listening socket the long way around, so its options don't
/// depend on platform defaults.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, IoError> {
	let socket = Socket::new(
		Domain::for_address(addr),
		Type::STREAM,
		Some(SocketProtocol::TCP),
	)?;

	// `SO_REUSEADDR` has different meanings across platforms:
	// - On Windows, it allows multiple listeners per socket (which is very bad)
	// - On Unix-like OSs, it allows a process to bind to a recently-closed
	//   socket (which can occasionally speed up socket initialization)
	socket.set_reuse_address(cfg!(unix))?;
	// An IPv6 listen address only listens on IPv6; `--listen` takes separate
	// IPv4 and IPv6 addresses, and the defaults include both
	if addr.is_ipv6() {
		socket.set_only_v6(true)?;
	}
	// Required for Tokio to properly use async listeners
	socket.set_nonblocking(true)?;
	// Improves latency when sending replies
	socket.set_nodelay(true)?;

	socket.bind(&addr.into())?;
	socket.listen(LISTENER_TCP_BACKLOG_SIZE)?;
	TcpListener::from_std(socket.into())
}

/// Accept connections forever, spawning one serve task per connection.
async fn accept_loop(listener: TcpListener, mux: Arc<Multiplexer>) -> Result<(), Error> {
	let local = listener.local_addr()?;
	debug!("accepting connections on {local}");

	let mut backoff = None::<Duration>;
	loop {
		match listener.accept().await {
			Ok((conn, remote)) => {
				backoff = None;
				let mux = Arc::clone(&mux);
				tokio::spawn(async move {
					if let Err(err) = mux.serve(conn).await {
						error!("error in {remote} -> {local}: {err}");
					}
				});
			}
			Err(err) if is_transient(&err) => {
				let delay = backoff.map_or(ACCEPT_BACKOFF_INITIAL, |prev| {
					(prev * 2).min(ACCEPT_BACKOFF_MAX)
				});
				backoff = Some(delay);
				error!("accept error on {local}: {err}; retrying in {delay:?}");
				sleep(delay).await;
			}
			Err(err) => return Err(err.into()),
		}
	}
}

/// Whether an accept error is worth retrying. Per-connection failures
/// surfaced through accept and resource exhaustion recover on their own;
/// anything else means the listener itself is broken.
fn is_transient(err: &IoError) -> bool {
	if matches!(
		err.kind(),
		ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
	) {
		return true;
	}
	// EMFILE, ENFILE, ENOBUFS, ENOMEM
	matches!(err.raw_os_error(), Some(code) if [24, 23, 105, 12].contains(&code))
}

#[cfg(test)]
mod tests {
	use muxproxy_routemap::RouteSet;
	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::TcpStream,
	};

	use super::*;

	#[tokio::test]
	async fn binds_ephemeral_ports() {
		let router = Arc::new(Router::new(RouteSet::empty()));
		let server = Server::bind(
			&["127.0.0.1:0".to_string(), "[::1]:0".to_string()],
			router,
		)
		.unwrap();

		let addrs = server.local_addrs();
		assert_eq!(addrs.len(), 2);
		assert!(addrs[0].is_ipv4());
		assert!(addrs[1].is_ipv6());
		assert_ne!(addrs[0].port(), 0);
	}

	#[tokio::test]
	async fn rejects_bad_listen_addresses() {
		let router = Arc::new(Router::new(RouteSet::empty()));
		assert!(matches!(
			Server::bind(&["not-an-address".to_string()], router),
			Err(BindError::Address(..))
		));
	}

	#[tokio::test]
	async fn unmatched_garbage_is_closed_at_the_peek_budget() {
		let router = Arc::new(Router::new(RouteSet::empty()));
		let server = Server::bind(&["127.0.0.1:0".to_string()], router).unwrap();
		let addr = server.local_addrs()[0];
		tokio::spawn(server.run());

		let mut conn = TcpStream::connect(addr).await.unwrap();
		// no request line, not SOCKS: nothing can ever claim this
		conn.write_all(&[b'z'; 1024]).await.unwrap();

		let mut buf = Vec::new();
		let read = conn.read_to_end(&mut buf).await.unwrap();
		assert_eq!(read, 0, "server closes without sending anything");
	}
}
