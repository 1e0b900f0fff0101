//! Error collections, declared validators, and child-error projection.
//!
//! Validation failures never raise: they land in the owning record's
//! [`Errors`] collection and callers inspect that. The [`ErrorProjector`]
//! is the piece that copies a child record's failures onto its owner under
//! the right attribute path when associations are cascade-validated.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::reflection::Reflection;
use crate::value::{AttributeMap, is_blank};

/// One validation failure: the attribute path it is attributed to and a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
	pub attribute: String,
	pub message: String,
}

impl fmt::Display for ErrorEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.attribute, self.message)
	}
}

/// Ordered collection of validation failures for one record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Errors {
	entries: Vec<ErrorEntry>,
}

impl Errors {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
		self.entries.push(ErrorEntry {
			attribute: attribute.into(),
			message: message.into(),
		});
	}

	/// Import an entry verbatim, keeping its message but re-attributing it.
	pub fn import(&mut self, attribute: impl Into<String>, entry: &ErrorEntry) {
		self.entries.push(ErrorEntry {
			attribute: attribute.into(),
			message: entry.message.clone(),
		});
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
		self.entries.iter()
	}

	/// Messages recorded against one attribute path.
	pub fn on(&self, attribute: &str) -> Vec<&str> {
		self.entries
			.iter()
			.filter(|e| e.attribute == attribute)
			.map(|e| e.message.as_str())
			.collect()
	}

	/// `"attribute message"` strings for every entry, in insertion order.
	pub fn full_messages(&self) -> Vec<String> {
		self.entries.iter().map(|e| e.to_string()).collect()
	}

	/// Collapse exact attribute+message duplicates, keeping first
	/// occurrences in order. Runs once after all associations have been
	/// cascade-validated.
	pub fn dedup(&mut self) {
		let mut seen: Vec<(String, String)> = Vec::with_capacity(self.entries.len());
		self.entries.retain(|e| {
			let key = (e.attribute.clone(), e.message.clone());
			if seen.contains(&key) {
				false
			} else {
				seen.push(key);
				true
			}
		});
	}
}

/// Shared validation rule run against a record's attribute map.
pub type ValidationRule = Arc<dyn Fn(&AttributeMap, &mut Errors) + Send + Sync>;

/// A validator declared on a class.
#[derive(Clone)]
pub enum Validator {
	/// The attribute must not be blank.
	Required { attribute: String },
	/// An arbitrary rule over the whole attribute map.
	Rule(ValidationRule),
}

impl Validator {
	pub fn run(&self, attributes: &AttributeMap, errors: &mut Errors) {
		match self {
			Validator::Required { attribute } => {
				let blank = attributes.get(attribute).is_none_or(is_blank);
				if blank {
					errors.add(attribute.clone(), "can't be blank");
				}
			}
			Validator::Rule(rule) => rule(attributes, errors),
		}
	}
}

impl fmt::Debug for Validator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Validator::Required { attribute } => {
				f.debug_struct("Required").field("attribute", attribute).finish()
			}
			Validator::Rule(_) => f.write_str("Rule(..)"),
		}
	}
}

/// Maps a child record's validation errors onto the owner's collection.
///
/// Attribute paths are `"{name}.{attr}"`, or `"{name}[{i}].{attr}"` when
/// the reflection asks for indexed paths and a collection index is known.
/// The index reflects the child's position at validation time.
pub struct ErrorProjector;

impl ErrorProjector {
	/// Copy every entry of `child_errors` onto `owner_errors` under the
	/// association-scoped attribute path.
	pub fn project(
		owner_errors: &mut Errors,
		reflection: &Reflection,
		child_errors: &Errors,
		index: Option<usize>,
	) {
		for entry in child_errors.iter() {
			let attribute = Self::attribute_path(reflection, index, &entry.attribute);
			owner_errors.import(attribute, entry);
		}
	}

	fn attribute_path(reflection: &Reflection, index: Option<usize>, attribute: &str) -> String {
		match index {
			Some(i) if reflection.options().index_errors => {
				format!("{}[{}].{}", reflection.name(), i, attribute)
			}
			_ => format!("{}.{}", reflection.name(), attribute),
		}
	}
}
