//! Route rules: one parsed line of a route file, and its matching logic.

use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	net::IpAddr,
};

use ipnet::IpNet;

use crate::dest::Destination;

/// The error returned when a single route line can not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
	/// The line does not consist of exactly two fields
	#[error("invalid route {0:?}")]
	InvalidRoute(String),
	/// The line starts with `^`, which is reserved for regex routes
	#[error("regular expression routes are not supported: {0:?}")]
	RegexUnsupported(String),
	/// A `[`-bracketed match specifier has no closing `]`
	#[error("missing closing ']' in {0:?}")]
	MissingBracket(String),
	/// Something other than `:port` follows the closing `]`
	#[error("only ':' allowed after ']' in {0:?}")]
	BadPortSuffix(String),
	/// The network part is neither an IP address nor a CIDR
	#[error("invalid IP address/network {0:?}")]
	InvalidNetwork(String),
	/// The target is neither `direct` nor `socks5://host:port`
	#[error("invalid target {0:?}")]
	InvalidTarget(String),
}

/// A domain match pattern, as written in a route file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
	/// `*`: any destination requested by name
	Any,
	/// `.suffix`: `suffix` itself, or any name ending in `.suffix`
	Suffix(String),
	/// An exact, full domain name
	Exact(String),
}

impl DomainPattern {
	fn matches(&self, domain: &str) -> bool {
		match self {
			Self::Any => true,
			Self::Suffix(suffix) => {
				domain == suffix
					|| (domain.len() > suffix.len()
						&& domain.ends_with(suffix)
						&& domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
			}
			Self::Exact(exact) => domain == exact,
		}
	}
}

impl Display for DomainPattern {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Any => fmt.write_str("*"),
			Self::Suffix(suffix) => write!(fmt, ".{suffix}"),
			Self::Exact(exact) => fmt.write_str(exact),
		}
	}
}

/// What a rule matches destinations against: an address block or a domain
/// pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
	/// An address block; single-host rules are a full-width prefix
	Cidr(IpNet),
	/// A domain pattern
	Domain(DomainPattern),
}

/// Where matching connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
	/// A plain TCP connection to the destination itself
	Direct,
	/// A SOCKS5 server (no authentication) at `host:port`
	Socks5(String),
}

impl Upstream {
	/// The target name as written in route files, used in access logs
	#[must_use]
	pub fn name(&self) -> String {
		self.to_string()
	}
}

impl Display for Upstream {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Direct => fmt.write_str("direct"),
			Self::Socks5(addr) => write!(fmt, "socks5://{addr}"),
		}
	}
}

/// One route: a matcher, an optional port filter, and the upstream that
/// matching connections are dialed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
	matcher: Matcher,
	port: String,
	upstream: Upstream,
}

impl Rule {
	/// Parse a single route file line. Returns `Ok(None)` for blank and
	/// comment-only lines; comments starting mid-line are dropped.
	///
	/// # Errors
	/// Returns a [`RouteError`] describing the first problem with the line.
	pub fn parse(line: &str) -> Result<Option<Self>, RouteError> {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			return Ok(None);
		}
		if line.starts_with('^') {
			return Err(RouteError::RegexUnsupported(line.to_string()));
		}

		// drop trailing comment; the syntax has no quoting
		let line = line.split('#').next().unwrap_or(line);
		let mut fields = line.split_whitespace();
		let (Some(spec), Some(target), None) = (fields.next(), fields.next(), fields.next())
		else {
			return Err(RouteError::InvalidRoute(line.to_string()));
		};

		let upstream = parse_target(target)?;
		parse_match(spec, upstream).map(Some)
	}

	/// Whether this rule covers `dest`: the matcher must cover the
	/// destination's IP or domain, and the port filter (if any) must equal
	/// the destination port exactly.
	#[must_use]
	pub fn matches(&self, dest: &Destination) -> bool {
		if !self.port.is_empty() && self.port != dest.port() {
			return false;
		}
		match &self.matcher {
			Matcher::Cidr(net) => dest.ip().is_some_and(|ip| net.contains(&ip)),
			Matcher::Domain(pattern) => {
				let domain = dest.domain().trim_end_matches('.');
				!domain.is_empty() && pattern.matches(domain)
			}
		}
	}

	/// This rule's matcher
	#[must_use]
	pub fn matcher(&self) -> &Matcher {
		&self.matcher
	}

	/// This rule's port filter, empty if the rule matches any port
	#[must_use]
	pub fn port(&self) -> &str {
		&self.port
	}

	/// The upstream matching connections are dialed through
	#[must_use]
	pub fn upstream(&self) -> &Upstream {
		&self.upstream
	}
}

impl Display for Rule {
	/// The canonical route line form; parsing it yields the same rule
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match &self.matcher {
			Matcher::Cidr(net @ IpNet::V4(_)) => write!(fmt, "{net}")?,
			Matcher::Cidr(net @ IpNet::V6(_)) => write!(fmt, "[{net}]")?,
			Matcher::Domain(pattern) => write!(fmt, "{pattern}")?,
		}
		if !self.port.is_empty() {
			write!(fmt, ":{}", self.port)?;
		}
		write!(fmt, " {}", self.upstream)
	}
}

/// Parse a route target: `direct`, or `socks5://host:port`.
fn parse_target(target: &str) -> Result<Upstream, RouteError> {
	if target == "direct" {
		Ok(Upstream::Direct)
	} else if let Some(addr) = target.strip_prefix("socks5://") {
		// catch bad upstream addresses at startup instead of at dial time
		crate::dest::Destination::parse(addr)
			.map_err(|_| RouteError::InvalidTarget(target.to_string()))?;
		Ok(Upstream::Socks5(addr.to_string()))
	} else {
		Err(RouteError::InvalidTarget(target.to_string()))
	}
}

/// Parse a match specifier into a full rule.
///
/// The specifier is first split into network/host/port slots:
/// - `[...]` up to the last `]` is the network, optionally followed by
///   `:port`
/// - anything containing `/` is a CIDR network, with a port split off if a
///   colon follows the slash
/// - exactly one `:` splits host and port
/// - two or more `:` means the whole thing is an IPv6 literal
/// - otherwise it is a bare host
///
/// A host slot that parses as an IP is promoted to a single-host network
/// (full-width prefix). What remains a non-empty host becomes a domain
/// rule; everything else must parse as an IP or CIDR network.
fn parse_match(spec: &str, upstream: Upstream) -> Result<Rule, RouteError> {
	let mut network = "";
	let mut host = "";
	let mut port = "";

	if spec.starts_with('[') {
		let rbracket = spec
			.rfind(']')
			.ok_or_else(|| RouteError::MissingBracket(spec.to_string()))?;
		network = &spec[1..rbracket];
		if spec.len() > rbracket + 1 {
			port = spec[rbracket + 1..]
				.strip_prefix(':')
				.ok_or_else(|| RouteError::BadPortSuffix(spec.to_string()))?;
		}
	} else if let Some(slash) = spec.find('/') {
		match spec.rfind(':') {
			Some(colon) if colon > slash => {
				network = &spec[..colon];
				port = &spec[colon + 1..];
			}
			_ => network = spec,
		}
	} else if let Some(colon) = spec.find(':') {
		if spec[colon + 1..].contains(':') {
			// 2 or more colons: always interpret as IPv6 address
			network = spec;
		} else {
			host = &spec[..colon];
			port = &spec[colon + 1..];
		}
	} else {
		host = spec;
	}

	let matcher = if let Ok(ip) = host.parse::<IpAddr>() {
		Matcher::Cidr(host_net(ip))
	} else if !host.is_empty() {
		let domain = host.trim_end_matches('.');
		Matcher::Domain(match domain {
			"*" => DomainPattern::Any,
			_ => match domain.strip_prefix('.') {
				Some(suffix) => DomainPattern::Suffix(suffix.to_string()),
				None => DomainPattern::Exact(domain.to_string()),
			},
		})
	} else if let Ok(ip) = network.parse::<IpAddr>() {
		Matcher::Cidr(host_net(ip))
	} else {
		let net = network
			.parse::<IpNet>()
			.map_err(|_| RouteError::InvalidNetwork(network.to_string()))?;
		Matcher::Cidr(net.trunc())
	};

	Ok(Rule {
		matcher,
		port: port.to_string(),
		upstream,
	})
}

/// A single-host network: the IP with a full-width prefix
fn host_net(ip: IpAddr) -> IpNet {
	IpNet::new(ip, ip_bits(ip)).expect("full-width prefix length is always valid")
}

const fn ip_bits(ip: IpAddr) -> u8 {
	match ip {
		IpAddr::V4(_) => 32,
		IpAddr::V6(_) => 128,
	}
}
