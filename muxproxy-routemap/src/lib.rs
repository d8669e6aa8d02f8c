//! Destination classification and first-match route rules for muxproxy
//!
//! This crate implements the data model behind muxproxy's routing decisions,
//! without doing any I/O itself: parsing a requested `host:port` into a
//! [`Destination`], parsing a route file into an ordered [`RouteSet`], and
//! looking up the first [`Rule`] whose matcher covers a destination. Actually
//! connecting anywhere is the job of the server crate.
//!
//! # Route file syntax
//!
//! A route file is line-oriented UTF-8. `#` starts a comment running to the
//! end of the line; blank and comment-only lines are skipped. Every other
//! line consists of exactly two whitespace-separated fields: a match
//! specifier and a target.
//!
//! The match specifier is one of:
//! - a bare domain (`example.com`), matching that name exactly
//! - a wildcard-suffix domain (`.example.com`), matching `example.com`
//!   itself and any name ending in `.example.com`
//! - `*`, matching any destination that was requested by name
//! - an IPv4 literal (`192.0.2.1`) or IPv4 CIDR (`10.0.0.0/8`)
//! - a bracketed IPv6 literal (`[::1]`) or CIDR (`[2001:db8::/32]`)
//! - any of the above with a trailing `:port`, restricting the rule to
//!   destinations with exactly that port
//!
//! A leading `^` is reserved for regular-expression matches, which are not
//! supported; such lines are rejected with an error rather than silently
//! ignored.
//!
//! The target is either `direct` (connect straight to the destination) or
//! `socks5://host:port` (connect through the given SOCKS5 server, without
//! authentication).
//!
//! ```text
//! # corporate networks go through the bastion
//! 10.0.0.0/8           socks5://bastion.corp:1080
//! .corp.example.com    socks5://bastion.corp:1080
//!
//! # plain IPv6 management net, but only ssh
//! [2001:db8:aa::/48]:22    direct
//!
//! # everything else
//! *                    direct
//! ```
//!
//! Rules are evaluated in declaration order and the first match wins. A
//! destination no rule matches is connected [`Upstream::Direct`]ly.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod dest;
mod rule;
mod set;


pub use dest::{join_host_port, AddressError, Destination};
pub use rule::{DomainPattern, Matcher, Rule, RouteError, Upstream};
pub use set::{ParseError, RouteSet};
