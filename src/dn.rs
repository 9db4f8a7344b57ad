//! Minimal distinguished name handling.

use crate::err::{Error, Result};

/// A parsed distinguished name, most specific RDN first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
	/// `(attribute, value)` pairs with surrounding whitespace removed
	rdns: Vec<(String, String)>,
}

impl DistinguishedName {
	/// Parse a DN such as `uid=1, ou=Contacts, dc=salesforce, dc=com`.
	///
	/// The empty string is the root DN.
	pub fn parse(dn: &str) -> Result<Self> {
		if dn.trim().is_empty() {
			return Ok(Self { rdns: vec![] });
		}

		let rdns = dn
			.split(',')
			.map(|rdn| match rdn.split_once('=') {
				Some((attribute, value)) if !attribute.trim().is_empty() => {
					Ok((attribute.trim().to_owned(), value.trim().to_owned()))
				}
				_ => Err(Error::InvalidDn(dn.to_owned())),
			})
			.collect::<Result<_>>()?;
		Ok(Self { rdns })
	}

	/// The most specific RDN
	#[must_use]
	pub fn first(&self) -> Option<(&str, &str)> {
		self.rdns.first().map(|(attribute, value)| (attribute.as_str(), value.as_str()))
	}

	/// Number of RDNs
	#[must_use]
	pub fn len(&self) -> usize {
		self.rdns.len()
	}

	/// Whether this is the root DN
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rdns.is_empty()
	}

	/// Whether this DN equals `suffix` or lies below it, ignoring case
	#[must_use]
	pub fn is_within(&self, suffix: &Self) -> bool {
		self.rdns.len() >= suffix.rdns.len()
			&& self.rdns[self.rdns.len() - suffix.rdns.len()..].iter().zip(&suffix.rdns).all(
				|((attribute, value), (suffix_attribute, suffix_value))| {
					attribute.eq_ignore_ascii_case(suffix_attribute)
						&& value.eq_ignore_ascii_case(suffix_value)
				},
			)
	}
}
