//! An ordered set of route rules with first-match lookup.

use std::str::FromStr;

use crate::{dest::Destination, rule::Rule, RouteError};

/// The error returned when a route file can not be parsed, carrying the
/// 1-based line number of the offending line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error in config line {line}: {source}")]
pub struct ParseError {
	/// The 1-based line number the error occurred on
	pub line: usize,
	/// What was wrong with that line
	#[source]
	pub source: RouteError,
}

/// An ordered sequence of [`Rule`]s, parsed from a route file.
///
/// Lookup is strictly first-match: rules are tried in declaration order and
/// the first one whose matcher and port filter cover the destination wins.
/// A `RouteSet` is immutable once parsed and can be shared freely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
	rules: Vec<Rule>,
}

impl RouteSet {
	/// An empty route set; every destination falls through to a direct
	/// connection.
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	/// Parse a whole route file. Blank lines and comments are skipped;
	/// the remaining lines become rules, in file order.
	///
	/// # Errors
	/// Returns a [`ParseError`] naming the first unparseable line.
	pub fn parse(input: &str) -> Result<Self, ParseError> {
		let mut rules = Vec::new();

		for (num, line) in input.lines().enumerate() {
			match Rule::parse(line) {
				Ok(Some(rule)) => rules.push(rule),
				Ok(None) => {}
				Err(source) => {
					return Err(ParseError {
						line: num + 1,
						source,
					})
				}
			}
		}

		Ok(Self { rules })
	}

	/// Find the first rule matching `dest`, or `None` if the destination
	/// should be connected directly.
	#[must_use]
	pub fn lookup(&self, dest: &Destination) -> Option<&Rule> {
		self.rules.iter().find(|rule| rule.matches(dest))
	}

	/// The rules in this set, in match order
	pub fn iter(&self) -> impl Iterator<Item = &Rule> {
		self.rules.iter()
	}

	/// The number of rules in this set
	#[must_use]
	pub fn len(&self) -> usize {
		self.rules.len()
	}

	/// Whether this set has no rules at all
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}
}

impl FromStr for RouteSet {
	type Err = ParseError;

	fn from_str(input: &str) -> Result<Self, Self::Err> {
		Self::parse(input)
	}
}
