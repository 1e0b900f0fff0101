//! Association metadata.
//!
//! A [`Reflection`] describes one declared association: its name, its
//! cardinality, the class of the related records, and the foreign key that
//! ties the related records back to the owner. Reflections are created once
//! at class-declaration time, shared behind an `Arc` by every owner
//! instance of the class, and never mutated afterwards.

use std::sync::Arc;

use crate::error::{FormError, FormResult};
use crate::registry::ClassDescriptor;

/// Cardinality of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
	/// A singular association: the owner references at most one record.
	HasOne,
	/// A collection association: the owner references an ordered set of
	/// records.
	HasMany,
}

impl AssociationKind {
	/// Whether this kind holds an ordered sequence of records.
	pub fn is_collection(self) -> bool {
		matches!(self, AssociationKind::HasMany)
	}
}

impl std::fmt::Display for AssociationKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			AssociationKind::HasOne => write!(f, "singular"),
			AssociationKind::HasMany => write!(f, "a collection"),
		}
	}
}

/// Per-reflection behavior switches.
///
/// `validate` and `autosave` control whether the owner's validation pass
/// descends into this association. `index_errors` switches child error
/// paths from `name.attr` to `name[i].attr`. `inverse_of` names the
/// reciprocal singular association on the target class that is pointed
/// back at the owner when records are assigned.
#[derive(Debug, Clone, Default)]
pub struct ReflectionOptions {
	pub validate: bool,
	pub autosave: bool,
	pub index_errors: bool,
	pub inverse_of: Option<String>,
}

/// Immutable metadata for one declared association.
///
/// # Examples
///
/// ```
/// use active_form::reflection::{AssociationKind, Reflection};
///
/// let reflection = Reflection::new("barcodes", AssociationKind::HasMany, "BarcodeForm", "order_id");
/// assert!(reflection.is_collection());
/// assert_eq!(reflection.foreign_key(), "order_id");
/// ```
#[derive(Debug, Clone)]
pub struct Reflection {
	name: String,
	kind: AssociationKind,
	class_name: String,
	foreign_key: String,
	options: ReflectionOptions,
}

impl Reflection {
	/// Create a reflection with default options (`validate` on, everything
	/// else off).
	pub fn new(
		name: impl Into<String>,
		kind: AssociationKind,
		class_name: impl Into<String>,
		foreign_key: impl Into<String>,
	) -> Self {
		Self {
			name: name.into(),
			kind,
			class_name: class_name.into(),
			foreign_key: foreign_key.into(),
			options: ReflectionOptions {
				validate: true,
				..ReflectionOptions::default()
			},
		}
	}

	/// Replace the option set.
	pub fn with_options(mut self, options: ReflectionOptions) -> Self {
		self.options = options;
		self
	}

	/// Name the reciprocal singular association on the target class.
	pub fn inverse_of(mut self, name: impl Into<String>) -> Self {
		self.options.inverse_of = Some(name.into());
		self
	}

	/// Switch child error paths to `name[i].attr` form.
	pub fn index_errors(mut self, enabled: bool) -> Self {
		self.options.index_errors = enabled;
		self
	}

	/// Turn cascade validation on or off for this association.
	pub fn validate(mut self, enabled: bool) -> Self {
		self.options.validate = enabled;
		self
	}

	/// Mark the association for autosave. Nested-attribute declarations
	/// flip this on implicitly.
	pub fn autosave(mut self, enabled: bool) -> Self {
		self.options.autosave = enabled;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> AssociationKind {
		self.kind
	}

	pub fn is_collection(&self) -> bool {
		self.kind.is_collection()
	}

	/// Class name of the related records.
	pub fn class_name(&self) -> &str {
		&self.class_name
	}

	/// Attribute on the related records holding the owner's id.
	pub fn foreign_key(&self) -> &str {
		&self.foreign_key
	}

	pub fn options(&self) -> &ReflectionOptions {
		&self.options
	}

	/// Whether the owner's validation pass descends into this association.
	pub fn validates_target(&self) -> bool {
		self.options.validate || self.options.autosave
	}

	/// Descriptor of the related records' class, resolved against the
	/// process-wide registry at use time so classes may be declared in any
	/// order.
	pub fn target_class(&self) -> FormResult<Arc<ClassDescriptor>> {
		crate::registry::fetch(&self.class_name)
	}

	/// Reject structurally unusable declarations early, so every later
	/// operation can assume a well-formed reflection.
	pub fn check_validity(&self) -> FormResult<()> {
		if self.name.is_empty() || self.class_name.is_empty() || self.foreign_key.is_empty() {
			return Err(FormError::InvalidPayload {
				association: self.name.clone(),
				detail: "reflection requires a name, class name, and foreign key".into(),
			});
		}
		Ok(())
	}
}
