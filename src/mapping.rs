//! Bidirectional mapping between directory object classes/attributes and
//! remote object types/fields.
//!
//! The table is built once from the mapping document at startup and is
//! immutable afterwards, so it can be shared between connections behind an
//! `Arc` without any locking.

use std::{collections::HashMap, path::Path};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::err::{Error, Result};

/// The attribute every directory entry carries to list its classes
pub const OBJECT_CLASS_ATTRIBUTE: &str = "objectclass";

/// Mapping document as written by operators, keyed by remote object type
pub type MappingDocument = IndexMap<String, ObjectTypeConfig>;

/// Configuration of a single remote object type
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ObjectTypeConfig {
	/// Directory object classes entries of this type belong to
	#[serde(rename = "objectclasses")]
	pub object_classes: Vec<String>,
	/// Directory attribute to remote field name
	#[serde(default)]
	pub mappings: IndexMap<String, String>,
}

/// Lookup tables for one remote object type
#[derive(Debug, Clone)]
pub struct ObjectTypeMapping {
	/// Remote object type name, lower case
	name: String,
	/// Configured directory object classes
	object_classes: Vec<String>,
	/// Directory attribute to remote field
	forward: HashMap<String, String>,
	/// Remote field to directory attributes, in configuration order
	inverse: HashMap<String, Vec<String>>,
}

impl ObjectTypeMapping {
	/// Build the lookup tables for an object type
	fn build(name: &str, config: ObjectTypeConfig) -> Result<Self> {
		let mut forward: HashMap<String, String> = HashMap::new();
		let mut inverse: HashMap<String, Vec<String>> = HashMap::new();

		for (attribute, field) in config.mappings {
			let attribute = attribute.to_lowercase();
			let field = field.to_lowercase();

			match forward.get(&attribute) {
				Some(existing) if *existing != field => {
					return Err(Error::Config(format!(
						"attribute `{attribute}` of `{name}` maps to both `{existing}` and `{field}`"
					)));
				}
				Some(_) => continue,
				None => {}
			}

			inverse.entry(field.clone()).or_default().push(attribute.clone());
			forward.insert(attribute, field);
		}

		Ok(Self { name: name.to_lowercase(), object_classes: config.object_classes, forward, inverse })
	}

	/// Remote object type name
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Capitalized form of the object type, as used in DNs and class names
	#[must_use]
	pub fn display_name(&self) -> String {
		let mut chars = self.name.chars();
		match chars.next() {
			Some(first) => first.to_uppercase().chain(chars).collect(),
			None => String::new(),
		}
	}

	/// Map a directory attribute to its remote field.
	///
	/// Unmapped attributes are assumed to already name a remote field.
	#[must_use]
	pub fn forward(&self, attribute: &str) -> String {
		let attribute = attribute.to_lowercase();
		match self.forward.get(&attribute) {
			Some(field) => field.clone(),
			None => attribute,
		}
	}

	/// All directory attributes aliasing a remote field
	#[must_use]
	pub fn inverse(&self, field: &str) -> &[String] {
		self.inverse.get(&field.to_lowercase()).map_or(&[][..], Vec::as_slice)
	}

	/// Configured directory object classes
	#[must_use]
	pub fn object_classes(&self) -> &[String] {
		&self.object_classes
	}
}

/// The mapping table for every supported object type
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
	/// Per object type lookups, in configuration order
	types: IndexMap<String, ObjectTypeMapping>,
}

impl MappingTable {
	/// Load the mapping document from a JSON file
	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|err| {
			Error::Config(format!("failed to read mappings from {}: {err}", path.display()))
		})?;
		Self::from_json(&raw)
	}

	/// Parse a JSON mapping document
	pub fn from_json(raw: &str) -> Result<Self> {
		let document: MappingDocument = serde_json::from_str(raw)
			.map_err(|err| Error::Config(format!("malformed mapping document: {err}")))?;
		Self::from_document(document)
	}

	/// Build the table from an already parsed document
	pub fn from_document(document: MappingDocument) -> Result<Self> {
		let mut types = IndexMap::with_capacity(document.len());
		for (name, config) in document {
			let mapping = ObjectTypeMapping::build(&name, config)?;
			if types.insert(mapping.name().to_owned(), mapping).is_some() {
				return Err(Error::Config(format!("object type `{name}` is configured twice")));
			}
		}
		Ok(Self { types })
	}

	/// The configured object types, in configuration order
	pub fn object_types(&self) -> impl Iterator<Item = &ObjectTypeMapping> {
		self.types.values()
	}

	/// Number of configured object types
	#[must_use]
	pub fn len(&self) -> usize {
		self.types.len()
	}

	/// Whether no object type is configured
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.types.is_empty()
	}

	/// Lookups for a single object type
	#[must_use]
	pub fn get(&self, object_type: &str) -> Option<&ObjectTypeMapping> {
		self.types.get(&object_type.to_lowercase())
	}

	/// Map a directory attribute to a remote field of `object_type`
	#[must_use]
	pub fn forward_lookup(&self, object_type: &str, attribute: &str) -> String {
		match self.get(object_type) {
			Some(mapping) => mapping.forward(attribute),
			None => attribute.to_lowercase(),
		}
	}

	/// Directory attributes aliasing a remote field of `object_type`
	#[must_use]
	pub fn inverse_lookup(&self, object_type: &str, field: &str) -> &[String] {
		self.get(object_type).map_or(&[][..], |mapping| mapping.inverse(field))
	}

	/// Directory object classes of `object_type`
	#[must_use]
	pub fn object_classes_for(&self, object_type: &str) -> &[String] {
		self.get(object_type).map_or(&[][..], ObjectTypeMapping::object_classes)
	}
}
