#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod forward;
pub mod http;
pub mod mux;
pub mod peek;
pub mod router;
pub mod server;
pub mod socks;
pub mod util;

use std::io::Error as IoError;

/// The error produced while serving a single proxied connection.
///
/// These errors terminate one connection and are logged by the accept loop
/// with remote/local address context; they never take down the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// An I/O error on the client or upstream connection
	#[error("i/o error: {0}")]
	Io(#[from] IoError),

	/// A peek was requested for zero bytes
	#[error("invalid peek size: {0}")]
	InvalidPeekSize(usize),

	/// The peek budget was exhausted without any detector claiming the
	/// connection
	#[error("couldn't find handler within {0} bytes")]
	NoHandler(usize),

	/// The first byte of a SOCKS exchange was not a supported version
	#[error("invalid SOCKS version {0:#04x}")]
	InvalidSocksVersion(u8),

	/// A zero-terminated SOCKS string exceeded its length bound
	#[error("zero-terminated SOCKS string longer than {0} bytes")]
	StringTooLong(usize),

	/// The HTTP connection failed while being served
	#[error("http error: {0}")]
	Http(#[from] hyper::Error),
}
