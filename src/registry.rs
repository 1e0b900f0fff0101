//! Class descriptors and the process-wide class registry.
//!
//! A [`ClassDescriptor`] is the declaration-time description of a form
//! class: its attributes, association reflections, nested-attribute
//! options, validators, and named rules. Descriptors are built once
//! through [`ClassBuilder`], registered in a process-wide map, and read
//! concurrently thereafter without locking; nothing mutates a descriptor
//! after registration.
//!
//! Subtyping is a closed tag map: a base class declares its known variants
//! (`tag -> class name`), children name their parent, and tag resolution
//! fails with `UnknownVariant` instead of falling through to any dynamic
//! lookup.

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{FormError, FormResult};
use crate::nested_attributes::{
	LimitPredicate, LimitRule, NestedAttributesOptions, RejectPredicate, RejectRule,
};
use crate::reflection::{AssociationKind, Reflection};
use crate::validation::{ValidationRule, Validator};
use crate::value::AttributeMap;

/// Attribute that carries the variant tag in incoming parameters.
pub const DEFAULT_VARIANT_ATTRIBUTE: &str = "form_type";

static REGISTRY: Lazy<DashMap<String, Arc<ClassDescriptor>>> = Lazy::new(DashMap::new);

/// Look a registered class up by name.
pub fn lookup(name: &str) -> Option<Arc<ClassDescriptor>> {
	REGISTRY.get(name).map(|entry| entry.value().clone())
}

/// Look a registered class up by name, failing with `UnknownClass`.
pub fn fetch(name: &str) -> FormResult<Arc<ClassDescriptor>> {
	lookup(name).ok_or_else(|| FormError::UnknownClass(name.to_string()))
}

/// Immutable, registered description of one form class.
pub struct ClassDescriptor {
	name: String,
	parent: Option<String>,
	variant_attribute: String,
	variants: IndexMap<String, String>,
	attributes: AttributeMap,
	reflections: IndexMap<String, Arc<Reflection>>,
	nested_options: IndexMap<String, NestedAttributesOptions>,
	validators: Vec<Validator>,
	named_rules: IndexMap<String, RejectPredicate>,
	named_counts: IndexMap<String, LimitPredicate>,
}

impl std::fmt::Debug for ClassDescriptor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClassDescriptor")
			.field("name", &self.name)
			.field("parent", &self.parent)
			.field("attributes", &self.attributes.keys().collect::<Vec<_>>())
			.field("reflections", &self.reflections.keys().collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

impl ClassDescriptor {
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Declared attributes with their default values. Every class carries
	/// an implicit `id` attribute.
	pub fn attributes(&self) -> &AttributeMap {
		&self.attributes
	}

	pub fn has_attribute(&self, name: &str) -> bool {
		self.attributes.contains_key(name)
	}

	pub fn reflections(&self) -> &IndexMap<String, Arc<Reflection>> {
		&self.reflections
	}

	pub fn reflect_on(&self, name: &str) -> Option<Arc<Reflection>> {
		self.reflections.get(name).cloned()
	}

	pub fn nested_options_for(&self, name: &str) -> Option<NestedAttributesOptions> {
		self.nested_options.get(name).cloned()
	}

	pub fn accepts_nested_attributes_for(&self, name: &str) -> bool {
		self.nested_options.contains_key(name)
	}

	pub fn validators(&self) -> &[Validator] {
		&self.validators
	}

	pub fn named_rule(&self, name: &str) -> Option<RejectPredicate> {
		self.named_rules.get(name).cloned()
	}

	pub fn named_count(&self, name: &str) -> Option<LimitPredicate> {
		self.named_counts.get(name).cloned()
	}

	pub fn variant_attribute(&self) -> &str {
		&self.variant_attribute
	}

	pub fn has_variants(&self) -> bool {
		!self.variants.is_empty()
	}

	/// Resolve a variant tag against this class's closed subtype map.
	pub fn resolve_variant(&self, tag: &str) -> FormResult<Arc<ClassDescriptor>> {
		let class_name = self.variants.get(tag).ok_or_else(|| FormError::UnknownVariant {
			tag: tag.to_string(),
			base: self.name.clone(),
		})?;
		fetch(class_name)
	}

	/// Whether records of `other` may live in an association declared for
	/// this class: `other` is this class, or descends from it through the
	/// registered parent chain.
	pub fn accepts(&self, other: &ClassDescriptor) -> bool {
		if other.name == self.name {
			return true;
		}
		let mut current = other.parent.clone();
		let mut hops = 0;
		while let Some(name) = current {
			if name == self.name {
				return true;
			}
			hops += 1;
			if hops > 16 {
				break;
			}
			current = lookup(&name).and_then(|class| class.parent.clone());
		}
		false
	}
}

/// Builder for [`ClassDescriptor`].
///
/// # Examples
///
/// ```
/// use active_form::registry::ClassBuilder;
/// use active_form::nested_attributes::NestedAttributesOptions;
///
/// let class = ClassBuilder::new("TicketForm")
///     .attribute("subject")
///     .has_one("customer", "CustomerForm")
///     .accepts_nested_attributes_for("customer", NestedAttributesOptions::new())
///     .register()
///     .unwrap();
/// assert!(class.reflect_on("customer").is_some());
/// ```
pub struct ClassBuilder {
	name: String,
	parent: Option<String>,
	variant_attribute: String,
	variants: IndexMap<String, String>,
	attributes: AttributeMap,
	reflections: IndexMap<String, Reflection>,
	nested_options: IndexMap<String, NestedAttributesOptions>,
	validators: Vec<Validator>,
	named_rules: IndexMap<String, RejectPredicate>,
	named_counts: IndexMap<String, LimitPredicate>,
}

impl ClassBuilder {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			parent: None,
			variant_attribute: DEFAULT_VARIANT_ATTRIBUTE.to_string(),
			variants: IndexMap::new(),
			attributes: AttributeMap::new(),
			reflections: IndexMap::new(),
			nested_options: IndexMap::new(),
			validators: Vec::new(),
			named_rules: IndexMap::new(),
			named_counts: IndexMap::new(),
		}
	}

	/// Declare an attribute defaulting to null.
	pub fn attribute(mut self, name: impl Into<String>) -> Self {
		self.attributes.insert(name.into(), Value::Null);
		self
	}

	/// Declare an attribute with a default value.
	pub fn attribute_default(mut self, name: impl Into<String>, default: Value) -> Self {
		self.attributes.insert(name.into(), default);
		self
	}

	/// Name the parent class this one descends from.
	pub fn variant_of(mut self, parent: impl Into<String>) -> Self {
		self.parent = Some(parent.into());
		self
	}

	/// Register a known subtype under a tag.
	pub fn variant(mut self, tag: impl Into<String>, class_name: impl Into<String>) -> Self {
		self.variants.insert(tag.into(), class_name.into());
		self
	}

	/// Change the attribute carrying the variant tag.
	pub fn variant_attribute(mut self, name: impl Into<String>) -> Self {
		self.variant_attribute = name.into();
		self
	}

	/// Declare a singular association with the default foreign key.
	pub fn has_one(self, name: impl Into<String>, class_name: impl Into<String>) -> Self {
		let foreign_key = default_foreign_key(&self.name);
		self.association(Reflection::new(name, AssociationKind::HasOne, class_name, foreign_key))
	}

	/// Declare a collection association with the default foreign key.
	pub fn has_many(self, name: impl Into<String>, class_name: impl Into<String>) -> Self {
		let foreign_key = default_foreign_key(&self.name);
		self.association(Reflection::new(name, AssociationKind::HasMany, class_name, foreign_key))
	}

	/// Declare an association from a fully configured reflection.
	pub fn association(mut self, reflection: Reflection) -> Self {
		self.reflections.insert(reflection.name().to_string(), reflection);
		self
	}

	/// Attach nested-attribute options to a declared association. Turns
	/// autosave on for the association.
	pub fn accepts_nested_attributes_for(
		mut self,
		name: impl Into<String>,
		options: NestedAttributesOptions,
	) -> Self {
		self.nested_options.insert(name.into(), options);
		self
	}

	pub fn validates_required(mut self, attribute: impl Into<String>) -> Self {
		self.validators.push(Validator::Required {
			attribute: attribute.into(),
		});
		self
	}

	pub fn validate_with(mut self, rule: ValidationRule) -> Self {
		self.validators.push(Validator::Rule(rule));
		self
	}

	/// Register a named predicate usable as `RejectRule::Named`.
	pub fn named_rule(mut self, name: impl Into<String>, rule: RejectPredicate) -> Self {
		self.named_rules.insert(name.into(), rule);
		self
	}

	/// Register a named count usable as `LimitRule::Named`.
	pub fn named_count(mut self, name: impl Into<String>, rule: LimitPredicate) -> Self {
		self.named_counts.insert(name.into(), rule);
		self
	}

	/// Validate the declaration and publish it to the registry.
	pub fn register(mut self) -> FormResult<Arc<ClassDescriptor>> {
		for reflection in self.reflections.values() {
			reflection.check_validity()?;
		}

		for (name, options) in &self.nested_options {
			if !self.reflections.contains_key(name) {
				return Err(FormError::UnknownAssociation(name.clone()));
			}
			if let Some(RejectRule::Named(rule)) = &options.reject_if {
				if !self.named_rules.contains_key(rule) {
					return Err(FormError::InvalidPayload {
						association: name.clone(),
						detail: format!("named reject rule `{rule}` is not registered"),
					});
				}
			}
			if let Some(LimitRule::Named(rule)) = &options.limit {
				if !self.named_counts.contains_key(rule) {
					return Err(FormError::InvalidPayload {
						association: name.clone(),
						detail: format!("named limit rule `{rule}` is not registered"),
					});
				}
			}
		}

		// Nested-attribute declarations imply autosave on the association.
		let nested_names: Vec<String> = self.nested_options.keys().cloned().collect();
		for name in nested_names {
			let updated = self.reflections.get(&name).map(|r| r.clone().autosave(true));
			if let Some(updated) = updated {
				self.reflections.insert(name, updated);
			}
		}

		if !self.attributes.contains_key("id") {
			self.attributes.shift_insert(0, "id".to_string(), Value::Null);
		}

		let descriptor = Arc::new(ClassDescriptor {
			name: self.name.clone(),
			parent: self.parent,
			variant_attribute: self.variant_attribute,
			variants: self.variants,
			attributes: self.attributes,
			reflections: self
				.reflections
				.into_iter()
				.map(|(name, reflection)| (name, Arc::new(reflection)))
				.collect(),
			nested_options: self.nested_options,
			validators: self.validators,
			named_rules: self.named_rules,
			named_counts: self.named_counts,
		});

		REGISTRY.insert(self.name, descriptor.clone());
		Ok(descriptor)
	}
}

/// Default foreign key for associations declared on `class_name`: the
/// class name minus any `Form` suffix, snake-cased, plus `_id`.
pub fn default_foreign_key(class_name: &str) -> String {
	let base = class_name.strip_suffix("Form").filter(|s| !s.is_empty()).unwrap_or(class_name);
	format!("{}_id", snake_case(base))
}

fn snake_case(input: &str) -> String {
	let mut out = String::with_capacity(input.len() + 4);
	for (i, ch) in input.chars().enumerate() {
		if ch.is_uppercase() {
			if i > 0 {
				out.push('_');
			}
			out.extend(ch.to_lowercase());
		} else {
			out.push(ch);
		}
	}
	out
}
