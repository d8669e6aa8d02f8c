//! SOCKS4, SOCKS4a, and SOCKS5 server handling.
//!
//! One handler serves all three dialects: the first byte of the connection
//! selects the protocol family, and SOCKS4a is recognized by its in-band
//! `0.0.0.x` marker address. Only the CONNECT command is supported, and the
//! only SOCKS5 authentication method offered is "no authentication".

use std::{
	io::{Error as IoError, ErrorKind},
	net::{Ipv4Addr, SocketAddr},
	sync::Arc,
};

use async_trait::async_trait;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
};
use tracing::debug;

use crate::{
	forward::forward,
	mux::{ConnHandler, Detection, Protocol, ProtocolDetector},
	peek::PeekStream,
	router::Router,
	Error,
};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS4 reply codes (the SOCKS4 reply version byte is always zero)
const REPLY4_GRANTED: u8 = 90;
const REPLY4_REJECTED: u8 = 91;

/// SOCKS5 reply codes from RFC 1928 §6
const REPLY5_SUCCEEDED: u8 = 0x00;
const REPLY5_FAILURE: u8 = 0x01;
const REPLY5_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY5_HOST_UNREACHABLE: u8 = 0x04;
const REPLY5_CONNECTION_REFUSED: u8 = 0x05;
const REPLY5_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY5_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// No acceptable authentication method (RFC 1928 §3)
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const METHOD_NO_AUTH: u8 = 0x00;

/// Bounds on the zero-terminated strings in SOCKS4 requests, terminator
/// included
const MAX_USER_ID: usize = 128;
const MAX_SOCKS4A_HOST: usize = 256;

/// Detects SOCKS traffic by its version byte and hands it to a
/// [`SocksServer`].
pub struct SocksDetector {
	server: Arc<SocksServer>,
}

impl SocksDetector {
	/// Create a detector dispatching to a SOCKS server over `router`
	#[must_use]
	pub fn new(router: Arc<Router>) -> Self {
		Self {
			server: Arc::new(SocksServer::new(router)),
		}
	}
}

impl ProtocolDetector for SocksDetector {
	fn protocol(&self) -> Protocol {
		Protocol::Socks
	}

	fn detect(&self, peek: &[u8]) -> Result<Detection, Error> {
		match peek.first() {
			Some(&SOCKS4_VERSION | &SOCKS5_VERSION) => Ok(Detection::Claim(Box::new(
				SocksConn(Arc::clone(&self.server)),
			))),
			_ => Ok(Detection::Pass),
		}
	}
}

struct SocksConn(Arc<SocksServer>);

#[async_trait]
impl ConnHandler for SocksConn {
	async fn serve(self: Box<Self>, conn: PeekStream<TcpStream>) -> Result<(), Error> {
		self.0.serve_conn(conn).await
	}
}

/// A SOCKS server answering version 4, 4a, and 5 requests, dialing through
/// a [`Router`].
pub struct SocksServer {
	router: Arc<Router>,
}

impl SocksServer {
	/// Create a server whose outbound connections go through `router`
	#[must_use]
	pub fn new(router: Arc<Router>) -> Self {
		Self { router }
	}

	/// Serve one SOCKS connection from the version byte onwards. The
	/// connection is closed on every exit path by dropping it here.
	///
	/// # Errors
	/// Returns an error for protocol violations and connection-level I/O
	/// failures; where the protocol has a matching reply code it is sent
	/// before the error is returned.
	pub async fn serve_conn<S>(&self, mut conn: S) -> Result<(), Error>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin,
	{
		let version = conn.read_u8().await?;
		match version {
			SOCKS4_VERSION => self.serve_socks4(&mut conn).await,
			SOCKS5_VERSION => self.serve_socks5(&mut conn).await,
			other => Err(Error::InvalidSocksVersion(other)),
		}
	}

	/// SOCKS4 and SOCKS4a, after the version byte:
	/// command(1) port(2, BE) ip(4), then a zero-terminated user-id. The
	/// marker address `0.0.0.x` (x != 0) upgrades the request to 4a, with
	/// the destination host following as a second zero-terminated string.
	async fn serve_socks4<S>(&self, conn: &mut S) -> Result<(), Error>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin,
	{
		let mut hdr = [0_u8; 7];
		conn.read_exact(&mut hdr).await?;

		if hdr[0] != CMD_CONNECT {
			send_socks4_reply(conn, REPLY4_REJECTED).await?;
			return Ok(());
		}

		let port = u16::from_be_bytes([hdr[1], hdr[2]]);

		let mut carry = Vec::with_capacity(512);
		let user_id = match read_zero_terminated(&mut carry, conn, MAX_USER_ID).await {
			Ok(user_id) => user_id,
			Err(err) => {
				send_socks4_reply(conn, REPLY4_REJECTED).await?;
				return Err(err);
			}
		};
		debug!(
			user_id = %String::from_utf8_lossy(&user_id),
			"SOCKS4 CONNECT request"
		);

		let host = if hdr[3] == 0 && hdr[4] == 0 && hdr[5] == 0 && hdr[6] != 0 {
			// SOCKS4a: the real destination is a domain name
			match read_zero_terminated(&mut carry, conn, MAX_SOCKS4A_HOST).await {
				Ok(dest) => String::from_utf8_lossy(&dest).into_owned(),
				Err(err) => {
					send_socks4_reply(conn, REPLY4_REJECTED).await?;
					return Err(err);
				}
			}
		} else {
			Ipv4Addr::new(hdr[3], hdr[4], hdr[5], hdr[6]).to_string()
		};

		let address = muxproxy_routemap::join_host_port(&host, &port.to_string());
		match self.router.dial(&address).await {
			Err(err) => {
				send_socks4_reply(conn, REPLY4_REJECTED).await?;
				Err(err.into())
			}
			Ok(backend) => {
				send_socks4_reply(conn, REPLY4_GRANTED).await?;
				forward(conn, backend).await?;
				Ok(())
			}
		}
	}

	/// SOCKS5 (RFC 1928), after the version byte: method negotiation, then
	/// the CONNECT request with an IPv4, domain, or IPv6 destination.
	async fn serve_socks5<S>(&self, conn: &mut S) -> Result<(), Error>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin,
	{
		let nmethods = conn.read_u8().await?;
		let mut methods = vec![0_u8; nmethods as usize];
		conn.read_exact(&mut methods).await?;

		if !methods.contains(&METHOD_NO_AUTH) {
			// client doesn't support "no authentication"
			conn.write_all(&[SOCKS5_VERSION, NO_ACCEPTABLE_METHODS])
				.await?;
			return Ok(());
		}
		conn.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

		let mut hdr = [0_u8; 4];
		if let Err(err) = conn.read_exact(&mut hdr).await {
			send_socks5_error(conn, REPLY5_FAILURE).await?;
			return Err(err.into());
		}

		if hdr[0] != SOCKS5_VERSION {
			send_socks5_error(conn, REPLY5_FAILURE).await?;
			return Err(Error::InvalidSocksVersion(hdr[0]));
		}
		if hdr[1] != CMD_CONNECT {
			return send_socks5_error(conn, REPLY5_COMMAND_NOT_SUPPORTED).await;
		}

		let (host, port) = match hdr[3] {
			0x01 => {
				let mut ip_and_port = [0_u8; 6];
				if let Err(err) = conn.read_exact(&mut ip_and_port).await {
					send_socks5_error(conn, REPLY5_FAILURE).await?;
					return Err(err.into());
				}
				let ip = Ipv4Addr::new(ip_and_port[0], ip_and_port[1], ip_and_port[2], ip_and_port[3]);
				(
					ip.to_string(),
					u16::from_be_bytes([ip_and_port[4], ip_and_port[5]]),
				)
			}
			0x03 => {
				let len = match conn.read_u8().await {
					Ok(len) => len,
					Err(err) => {
						send_socks5_error(conn, REPLY5_FAILURE).await?;
						return Err(err.into());
					}
				};
				let mut host_and_port = vec![0_u8; len as usize + 2];
				if let Err(err) = conn.read_exact(&mut host_and_port).await {
					send_socks5_error(conn, REPLY5_FAILURE).await?;
					return Err(err.into());
				}
				let port =
					u16::from_be_bytes([host_and_port[len as usize], host_and_port[len as usize + 1]]);
				(
					String::from_utf8_lossy(&host_and_port[..len as usize]).into_owned(),
					port,
				)
			}
			0x04 => {
				let mut ip_and_port = [0_u8; 18];
				if let Err(err) = conn.read_exact(&mut ip_and_port).await {
					send_socks5_error(conn, REPLY5_FAILURE).await?;
					return Err(err.into());
				}
				let mut ip = [0_u8; 16];
				ip.copy_from_slice(&ip_and_port[..16]);
				(
					std::net::Ipv6Addr::from(ip).to_string(),
					u16::from_be_bytes([ip_and_port[16], ip_and_port[17]]),
				)
			}
			_ => return send_socks5_error(conn, REPLY5_ADDRESS_TYPE_NOT_SUPPORTED).await,
		};

		let address = muxproxy_routemap::join_host_port(&host, &port.to_string());
		debug!(%address, "SOCKS5 CONNECT request");
		match self.router.dial(&address).await {
			Err(err) => send_socks5_error(conn, map_dial_error(&err)).await,
			Ok(backend) => {
				send_socks5_reply(conn, REPLY5_SUCCEEDED, backend.local_addr().ok()).await?;
				forward(conn, backend).await?;
				Ok(())
			}
		}
	}
}

/// Read a zero-terminated string of at most `max` bytes (terminator
/// included) from `conn`, buffering through `carry`. Bytes read past the
/// terminator stay in `carry` for the next string on the same connection.
async fn read_zero_terminated<S>(
	carry: &mut Vec<u8>,
	conn: &mut S,
	max: usize,
) -> Result<Vec<u8>, Error>
where
	S: AsyncRead + Send + Unpin,
{
	loop {
		if let Some(zero) = carry.iter().position(|&b| b == 0) {
			let result = carry[..zero].to_vec();
			carry.drain(..=zero);
			return Ok(result);
		}

		if carry.len() >= max {
			return Err(Error::StringTooLong(max));
		}

		let read = (&mut *conn)
			.take((max - carry.len()) as u64)
			.read_buf(carry)
			.await?;
		if read == 0 {
			return Err(IoError::new(
				ErrorKind::UnexpectedEof,
				"end of stream inside zero-terminated string",
			)
			.into());
		}
	}
}

/// The 8-byte SOCKS4 reply; the bind address and port are always zero
async fn send_socks4_reply<S>(conn: &mut S, code: u8) -> Result<(), Error>
where
	S: AsyncWrite + Send + Unpin,
{
	let reply = [0, code, 0, 0, 0, 0, 0, 0];
	conn.write_all(&reply).await?;
	Ok(())
}

/// The SOCKS5 reply: version, code, reserved, then the bound address as
/// ATYP + address + port (zero IPv4 when there is none to report)
async fn send_socks5_reply<S>(
	conn: &mut S,
	code: u8,
	local: Option<SocketAddr>,
) -> Result<(), Error>
where
	S: AsyncWrite + Send + Unpin,
{
	let mut reply = Vec::with_capacity(22);
	reply.extend_from_slice(&[SOCKS5_VERSION, code, 0]);
	match local {
		Some(SocketAddr::V4(addr)) => {
			reply.push(0x01);
			reply.extend_from_slice(&addr.ip().octets());
			reply.extend_from_slice(&addr.port().to_be_bytes());
		}
		Some(SocketAddr::V6(addr)) => {
			reply.push(0x04);
			reply.extend_from_slice(&addr.ip().octets());
			reply.extend_from_slice(&addr.port().to_be_bytes());
		}
		None => {
			reply.push(0x01);
			reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
		}
	}
	conn.write_all(&reply).await?;
	Ok(())
}

async fn send_socks5_error<S>(conn: &mut S, code: u8) -> Result<(), Error>
where
	S: AsyncWrite + Send + Unpin,
{
	send_socks5_reply(conn, code, None).await
}

/// Map a dial error to the nearest SOCKS5 reply code. Typed error kinds are
/// preferred; the message text is inspected as a fallback because SOCKS5
/// upstream failures arrive as plain strings.
fn map_dial_error(err: &IoError) -> u8 {
	if err.kind() == ErrorKind::ConnectionRefused {
		return REPLY5_CONNECTION_REFUSED;
	}
	let msg = err.to_string().to_ascii_lowercase();
	if msg.contains("refused") {
		REPLY5_CONNECTION_REFUSED
	} else if msg.contains("network is unreachable") || msg.contains("network unreachable") {
		REPLY5_NETWORK_UNREACHABLE
	} else {
		REPLY5_HOST_UNREACHABLE
	}
}
