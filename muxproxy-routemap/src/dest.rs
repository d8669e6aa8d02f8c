//! Parsing of requested `host:port` destinations.
//!
//! A [`Destination`] classifies the host part of an address into either a
//! domain name or an IP literal (never both), which is what the routing
//! rules discriminate on. Name resolution is deliberately *not* done here;
//! a destination that was requested by name stays a name until whichever
//! dialer finally connects to it.

use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	net::IpAddr,
};

/// The error returned when an address can not be parsed into a
/// [`Destination`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
	/// The address has no `:port` suffix
	#[error("missing port in address {0:?}")]
	MissingPort(String),
	/// The host part contains unbracketed colons, or brackets are unbalanced
	#[error("invalid host:port split in address {0:?}")]
	BadHostPort(String),
	/// The host part contains more than one `%` zone separator
	#[error("invalid host {0:?}")]
	InvalidHost(String),
}

/// A single requested destination, as extracted from a SOCKS request, an
/// HTTP request URI, or a CONNECT target.
///
/// At most one of [`domain`][Self::domain] and [`ip`][Self::ip] is set: if
/// the host part parses as an IP literal the domain is empty, otherwise the
/// IP is absent. A destination is built per outbound request and discarded
/// once the routing decision is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
	address: String,
	domain: String,
	ip: Option<IpAddr>,
	zone: String,
	port: String,
}

impl Destination {
	/// Parse a `host:port` address (with the host optionally bracketed, and
	/// optionally carrying an IPv6 `%zone` suffix) into a `Destination`.
	///
	/// IPv4-mapped IPv6 literals (`::ffff:a.b.c.d`) are canonicalized to
	/// their IPv4 form so that they match IPv4 rules.
	///
	/// # Errors
	/// Returns an [`AddressError`] if the address has no port, the host/port
	/// split is ambiguous, or the host contains multiple `%` separators.
	pub fn parse(address: &str) -> Result<Self, AddressError> {
		let (host, port) = split_host_port(address)?;

		let (host, zone) = match host.matches('%').count() {
			0 => (host, ""),
			1 => host.split_once('%').unwrap_or((host, "")),
			_ => return Err(AddressError::InvalidHost(host.to_string())),
		};

		let ip = host.parse::<IpAddr>().ok().map(canonical);

		Ok(Self {
			address: address.to_string(),
			domain: if ip.is_some() {
				String::new()
			} else {
				host.to_string()
			},
			ip,
			// a zone only makes sense on an IP literal
			zone: if ip.is_some() {
				zone.to_string()
			} else {
				String::new()
			},
			port: port.to_string(),
		})
	}

	/// The original `host:port` address, suitable for dial functions
	#[must_use]
	pub fn address(&self) -> &str {
		&self.address
	}

	/// The domain name, if the destination was requested by name (empty
	/// otherwise)
	#[must_use]
	pub fn domain(&self) -> &str {
		&self.domain
	}

	/// The IP, if the destination host was an IP literal
	#[must_use]
	pub fn ip(&self) -> Option<IpAddr> {
		self.ip
	}

	/// The IPv6 zone identifier from a `[host%zone]:port` address, if any
	#[must_use]
	pub fn zone(&self) -> &str {
		&self.zone
	}

	/// The port part of the address, kept as the literal string it was
	/// requested with
	#[must_use]
	pub fn port(&self) -> &str {
		&self.port
	}
}

impl Display for Destination {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_str(&self.address)
	}
}

/// Split an address of the form `host:port` or `[host]:port` into its host
/// and port parts, without validating either.
fn split_host_port(address: &str) -> Result<(&str, &str), AddressError> {
	if let Some(rest) = address.strip_prefix('[') {
		let (host, rest) = rest
			.split_once(']')
			.ok_or_else(|| AddressError::BadHostPort(address.to_string()))?;
		let port = rest
			.strip_prefix(':')
			.ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
		Ok((host, port))
	} else {
		let (host, port) = address
			.rsplit_once(':')
			.ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
		if host.contains(':') {
			// unbracketed IPv6 with a trailing port is ambiguous
			return Err(AddressError::BadHostPort(address.to_string()));
		}
		Ok((host, port))
	}
}

/// Join a host and port into a dialable `host:port` address, bracketing the
/// host if it is an IPv6 literal.
#[must_use]
pub fn join_host_port(host: &str, port: &str) -> String {
	if host.contains(':') {
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	}
}

/// Canonicalize an IP, turning IPv4-mapped IPv6 addresses into plain IPv4
fn canonical(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
		v4 @ IpAddr::V4(_) => v4,
	}
}
