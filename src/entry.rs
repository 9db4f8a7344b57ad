//! Projection of remote records into directory entries.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
	mapping::{OBJECT_CLASS_ATTRIBUTE, ObjectTypeMapping},
	rest::Record,
};

/// Record key holding the API's own metadata, never projected
const METADATA_FIELD: &str = "attributes";

/// Record field carrying the record identifier
const ID_FIELD: &str = "id";

/// A directory entry synthesized from a remote record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
	/// Distinguished name
	pub dn: String,
	/// Object classes, configured classes first
	pub object_classes: Vec<String>,
	/// Single-valued attributes by lower-cased name
	pub attributes: BTreeMap<String, String>,
}

impl DirectoryEntry {
	/// Value of an attribute
	#[must_use]
	pub fn get(&self, attribute: &str) -> Option<&str> {
		self.attributes.get(&attribute.to_lowercase()).map(String::as_str)
	}

	/// Attributes to return to a client that asked for `requested`.
	///
	/// An empty request or `*` selects everything, including the object
	/// classes.
	#[must_use]
	pub fn select(&self, requested: &[String]) -> Vec<(String, Vec<String>)> {
		let everything = requested.is_empty() || requested.iter().any(|attribute| attribute == "*");
		let wanted = |name: &str| {
			everything || requested.iter().any(|attribute| attribute.eq_ignore_ascii_case(name))
		};

		let mut selected = Vec::with_capacity(self.attributes.len() + 1);
		if wanted(OBJECT_CLASS_ATTRIBUTE) {
			selected.push((OBJECT_CLASS_ATTRIBUTE.to_owned(), self.object_classes.clone()));
		}
		selected.extend(
			self.attributes
				.iter()
				.filter(|(name, _)| wanted(name))
				.map(|(name, value)| (name.clone(), vec![value.clone()])),
		);
		selected
	}
}

/// Naming rules for projected entries
#[derive(Debug, Clone)]
pub struct Projector {
	/// Directory suffix every entry lives below
	suffix: String,
	/// Prefix of the class tagging the record's object type
	origin_class_prefix: String,
}

impl Projector {
	/// Create a projector for entries below `suffix`
	#[must_use]
	pub fn new(suffix: impl Into<String>, origin_class_prefix: impl Into<String>) -> Self {
		Self { suffix: suffix.into(), origin_class_prefix: origin_class_prefix.into() }
	}

	/// The served suffix
	#[must_use]
	pub fn suffix(&self) -> &str {
		&self.suffix
	}

	/// Convert a record of `mapping`'s object type into an entry.
	///
	/// Every non-null field is stored under its lower-cased name and under
	/// each directory attribute aliasing it.
	#[must_use]
	pub fn project(&self, mapping: &ObjectTypeMapping, record: &Record) -> DirectoryEntry {
		let display_name = mapping.display_name();
		let mut attributes = BTreeMap::new();

		for (key, value) in record {
			if key == METADATA_FIELD {
				continue;
			}
			let Some(value) = stringify(value) else {
				continue;
			};

			let field = key.to_lowercase();
			for alias in mapping.inverse(&field) {
				attributes.insert(alias.clone(), value.clone());
			}
			attributes.insert(field, value);
		}

		// Taken from the record itself, an alias may shadow `id`
		let id = record
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(ID_FIELD))
			.and_then(|(_, value)| stringify(value))
			.unwrap_or_default();
		if id.is_empty() {
			tracing::warn!(object_type = mapping.name(), "Record without identifier");
		}
		let dn = format!("uid={id}, ou={display_name}s, {}", self.suffix);

		let mut object_classes = mapping.object_classes().to_vec();
		object_classes.push(format!("{}{display_name}", self.origin_class_prefix));

		DirectoryEntry { dn, object_classes, attributes }
	}
}

/// String form of a field value; `None` for values that must not be exposed
fn stringify(value: &Value) -> Option<String> {
	match value {
		Value::Null => None,
		Value::String(text) if text.is_empty() => None,
		Value::String(text) => Some(text.clone()),
		Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
			Some(value.to_string())
		}
	}
}
