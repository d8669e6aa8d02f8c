//! The protocol multiplexer: peek at an accepted connection, probe a chain
//! of detectors, and dispatch to the first handler that claims it.
//!
//! Detectors are probed in registration order against the peeked prefix.
//! A detector that can not decide yet simply passes; the multiplexer then
//! peeks deeper and probes again, until either a handler claims the
//! connection or the peek budget is exhausted. Because the peeked bytes are
//! replayed by [`PeekStream`], handing over the connection loses nothing.

use async_trait::async_trait;
use strum::Display as EnumDisplay;
use tokio::net::TcpStream;
use tracing::trace;

use crate::{peek::PeekStream, Error};

/// The default peek budget, in bytes
pub const DEFAULT_MAX_PEEK: usize = 1024;

/// The protocols a detector can claim a connection for
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum Protocol {
	/// SOCKS4, SOCKS4a, or SOCKS5
	Socks,
	/// An HTTP request line, well-formed or bare CONNECT
	Http,
}

/// What a detector concluded from the peeked prefix.
pub enum Detection {
	/// Not this detector's protocol, or not enough bytes to decide yet
	Pass,
	/// This connection belongs to the contained handler
	Claim(Box<dyn ConnHandler>),
}

/// A protocol detector, probed against the peeked prefix of each new
/// connection.
pub trait ProtocolDetector: Send + Sync {
	/// The protocol this detector recognizes, for logging
	fn protocol(&self) -> Protocol;

	/// Probe the peeked prefix. Returning [`Detection::Claim`] hands the
	/// connection to the contained handler and ends detection; an error
	/// closes the connection.
	///
	/// # Errors
	/// Implementations return an error for prefixes that are recognizably
	/// their protocol but unrecoverably malformed.
	fn detect(&self, peek: &[u8]) -> Result<Detection, Error>;
}

/// A claimed connection's handler. The handler owns the connection,
/// including closing it on every exit path (in practice: by dropping it).
#[async_trait]
pub trait ConnHandler: Send {
	/// Serve the connection to completion
	async fn serve(self: Box<Self>, conn: PeekStream<TcpStream>) -> Result<(), Error>;
}

/// A protocol multiplexer over an ordered chain of detectors.
pub struct Multiplexer {
	max_peek: usize,
	detectors: Vec<Box<dyn ProtocolDetector>>,
}

impl Multiplexer {
	/// Create a multiplexer probing `detectors` in the given order, with
	/// the default peek budget.
	///
	/// Order is policy: detectors that need fewer bytes to decide should
	/// come first, so the usual registration is SOCKS (one byte), then
	/// HTTP (a request line).
	#[must_use]
	pub fn new(detectors: Vec<Box<dyn ProtocolDetector>>) -> Self {
		Self {
			max_peek: DEFAULT_MAX_PEEK,
			detectors,
		}
	}

	/// Set the peek budget: the maximum number of prefix bytes examined
	/// before a connection without a matching handler is given up on
	#[must_use]
	pub fn with_max_peek(mut self, max_peek: usize) -> Self {
		self.max_peek = max_peek;
		self
	}

	/// Serve one accepted connection: peek, probe, and dispatch. Exactly
	/// one handler is ever given the connection; on any error path the
	/// connection is closed by dropping it here.
	///
	/// # Errors
	/// Surfaces peek I/O errors, detector errors, the handler's serve
	/// error, or [`Error::NoHandler`] when the peek budget is exhausted
	/// without a claim.
	pub async fn serve(&self, conn: TcpStream) -> Result<(), Error> {
		let mut conn = PeekStream::new(conn);

		loop {
			conn.peek(self.max_peek).await?;

			for detector in &self.detectors {
				match detector.detect(conn.read_ahead())? {
					Detection::Claim(handler) => {
						trace!(protocol = %detector.protocol(), "handler claimed connection");
						return handler.serve(conn).await;
					}
					Detection::Pass => {}
				}
			}

			if conn.read_ahead().len() >= self.max_peek {
				return Err(Error::NoHandler(self.max_peek));
			}
		}
	}
}
