//! Compilation of directory filter expressions into query `WHERE` clauses.
//!
//! Values are interpolated as quoted literals without escaping, so a value
//! containing a single quote ends the literal early.
// TODO: switch to bound query parameters once the remote query endpoint
// supports them, until then quotes in filter values reach the query as-is.

use crate::mapping::{OBJECT_CLASS_ATTRIBUTE, ObjectTypeMapping};

/// Predicate no record satisfies, every record has an identifier
const NEVER: &str = "id=null";

/// A structured directory search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	/// `(attr=value)`
	Equality(String, String),
	/// `(attr~=value)`, treated as equality
	Approx(String, String),
	/// `(attr=*)`
	Present(String),
	/// `(attr=initial*any*final)`
	Substring {
		/// Attribute the pattern applies to
		attribute: String,
		/// Leading fixed part
		initial: Option<String>,
		/// Middle fixed parts, in order
		any: Vec<String>,
		/// Trailing fixed part
		final_: Option<String>,
	},
	/// `(attr>=value)`
	GreaterOrEqual(String, String),
	/// `(attr<=value)`
	LessOrEqual(String, String),
	/// `(&...)`
	And(Vec<Filter>),
	/// `(|...)`
	Or(Vec<Filter>),
	/// `(!...)`
	Not(Box<Filter>),
}

/// Compile a filter into a predicate over the fields of `mapping`'s object
/// type. An empty string means "no predicate".
#[must_use]
pub fn compile(mapping: &ObjectTypeMapping, filter: &Filter) -> String {
	match filter {
		Filter::Equality(attribute, value) | Filter::Approx(attribute, value) => {
			format!("{}='{value}'", mapping.forward(attribute))
		}
		Filter::Present(attribute) => {
			let field = mapping.forward(attribute);
			if field == OBJECT_CLASS_ATTRIBUTE { String::new() } else { format!("{field}!=null") }
		}
		Filter::Substring { attribute, initial, any, final_ } => {
			let mut pattern = initial.clone().unwrap_or_default();
			pattern.push('%');
			for middle in any {
				pattern.push_str(middle);
				pattern.push('%');
			}
			pattern.push_str(final_.as_deref().unwrap_or_default());
			format!("{} LIKE '{pattern}'", mapping.forward(attribute))
		}
		Filter::GreaterOrEqual(attribute, value) => {
			format!("{}>='{value}'", mapping.forward(attribute))
		}
		Filter::LessOrEqual(attribute, value) => {
			format!("{}<='{value}'", mapping.forward(attribute))
		}
		Filter::And(filters) => join(mapping, filters, "AND").unwrap_or_default(),
		// A child without predicate matches everything, and so does the union
		Filter::Or(filters) => join(mapping, filters, "OR").unwrap_or_default(),
		// Negating a filter that matches everything matches nothing
		Filter::Not(filter) => match compile(mapping, filter) {
			fragment if fragment.is_empty() => NEVER.to_owned(),
			fragment => format!("NOT({fragment})"),
		},
	}
}

/// Parenthesize each child and join them with `operator`.
///
/// Children without predicate are dropped for `AND`; for `OR` they turn the
/// whole disjunction into `None`.
fn join(mapping: &ObjectTypeMapping, filters: &[Filter], operator: &str) -> Option<String> {
	let mut parts = Vec::with_capacity(filters.len());
	for filter in filters {
		let fragment = compile(mapping, filter);
		if fragment.is_empty() {
			if operator == "OR" {
				return None;
			}
			continue;
		}
		parts.push(format!("({fragment})"));
	}
	Some(parts.join(operator))
}

/// Render a compiled fragment as the clause appended to a query
#[must_use]
pub fn where_clause(fragment: &str) -> String {
	if fragment.is_empty() { String::new() } else { format!(" WHERE {fragment}") }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mapping::MappingTable;

	fn contact() -> ObjectTypeMapping {
		let table = MappingTable::from_json(
			r#"{"contact": {"objectclasses": ["person"], "mappings": {"mail": "email", "sn": "lastname"}}}"#,
		)
		.expect("valid mappings");
		table.get("contact").cloned().expect("contact is configured")
	}

	fn eq(attribute: &str, value: &str) -> Filter {
		Filter::Equality(attribute.to_owned(), value.to_owned())
	}

	#[test]
	fn test_and_parenthesizes_children() {
		let filter = Filter::And(vec![eq("a", "1"), eq("b", "2")]);
		assert_eq!(compile(&contact(), &filter), "(a='1')AND(b='2')");
	}

	#[test]
	fn test_or_and_not() {
		let filter = Filter::Or(vec![eq("mail", "x@y.z"), Filter::Not(Box::new(eq("sn", "Doe")))]);
		assert_eq!(compile(&contact(), &filter), "(email='x@y.z')OR(NOT(lastname='Doe'))");
	}

	#[test]
	fn test_negated_match_all() {
		let everything = Filter::Present("objectClass".to_owned());
		let contact = contact();

		let filter = Filter::Not(Box::new(everything.clone()));
		assert_eq!(where_clause(&compile(&contact, &filter)), " WHERE id=null");

		let filter = Filter::And(vec![
			eq("mail", "x"),
			Filter::Not(Box::new(Filter::Or(vec![everything.clone()]))),
		]);
		assert_eq!(compile(&contact, &filter), "(email='x')AND(id=null)");

		let filter = Filter::Not(Box::new(Filter::Not(Box::new(everything))));
		assert_eq!(compile(&contact, &filter), "NOT(id=null)");
	}

	#[test]
	fn test_empty_combinators() {
		assert_eq!(compile(&contact(), &Filter::And(vec![])), "");
		assert_eq!(compile(&contact(), &Filter::Or(vec![])), "");
	}

	#[test]
	fn test_substring() {
		let filter = Filter::Substring {
			attribute: "a".to_owned(),
			initial: Some("x".to_owned()),
			any: vec!["y".to_owned()],
			final_: Some("z".to_owned()),
		};
		assert_eq!(compile(&contact(), &filter), "a LIKE 'x%y%z'");

		let contains = Filter::Substring {
			attribute: "mail".to_owned(),
			initial: None,
			any: vec!["middle".to_owned()],
			final_: None,
		};
		assert_eq!(compile(&contact(), &contains), "email LIKE '%middle%'");

		let prefix = Filter::Substring {
			attribute: "sn".to_owned(),
			initial: Some("Do".to_owned()),
			any: vec![],
			final_: None,
		};
		assert_eq!(compile(&contact(), &prefix), "lastname LIKE 'Do%'");
	}

	#[test]
	fn test_presence() {
		assert_eq!(compile(&contact(), &Filter::Present("objectclass".to_owned())), "");
		assert_eq!(compile(&contact(), &Filter::Present("objectClass".to_owned())), "");
		assert_eq!(compile(&contact(), &Filter::Present("mail".to_owned())), "email!=null");
	}

	#[test]
	fn test_ordering_and_approx() {
		let mapping = contact();
		assert_eq!(
			compile(&mapping, &Filter::GreaterOrEqual("sn".to_owned(), "M".to_owned())),
			"lastname>='M'"
		);
		assert_eq!(
			compile(&mapping, &Filter::LessOrEqual("sn".to_owned(), "M".to_owned())),
			"lastname<='M'"
		);
		assert_eq!(
			compile(&mapping, &Filter::Approx("mail".to_owned(), "a@b.com".to_owned())),
			"email='a@b.com'"
		);
	}

	#[test]
	fn test_where_clause() {
		assert_eq!(where_clause(""), "");
		assert_eq!(where_clause("email='a@b.com'"), " WHERE email='a@b.com'");

		let presence_only = Filter::And(vec![Filter::Present("objectclass".to_owned())]);
		assert_eq!(where_clause(&compile(&contact(), &presence_only)), "");
	}

	#[test]
	fn test_children_without_predicate() {
		let mapping = contact();
		let and = Filter::And(vec![Filter::Present("objectClass".to_owned()), eq("mail", "a@b.com")]);
		assert_eq!(compile(&mapping, &and), "(email='a@b.com')");

		let or = Filter::Or(vec![eq("mail", "a@b.com"), Filter::Present("objectclass".to_owned())]);
		assert_eq!(compile(&mapping, &or), "");
	}
}
