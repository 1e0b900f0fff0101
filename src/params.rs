//! Parameter intake.
//!
//! Raw parameter maps (the shape HTTP form/JSON payloads arrive in) are
//! routed through one explicit dispatch: `<name>_attributes` keys go to
//! the nested-attribute assigner, association names go to the association
//! writers, declared attributes are set directly, and unknown keys are
//! ignored. [`from_params`] additionally resolves a variant tag before
//! building the record.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{FormError, FormResult};
use crate::nested_attributes::NestedAttributesAssigner;
use crate::record::Record;
use crate::reflection::{AssociationKind, Reflection};
use crate::registry::ClassDescriptor;
use crate::store::Store;
use crate::value::{is_blank, object_to_attributes};

impl Record {
	/// Assign a raw parameter map to this record.
	///
	/// Keys are dispatched in order of specificity: nested-attribute
	/// writers, association writers, declared attributes. Unknown keys are
	/// skipped so a form can safely receive a superset of its own
	/// parameters.
	pub fn assign_params(&self, store: &dyn Store, params: &Map<String, Value>) -> FormResult<()> {
		let class = self.class();
		let assigner = NestedAttributesAssigner::new(store);

		for (key, value) in params {
			if let Some(name) = key.strip_suffix("_attributes") {
				if class.accepts_nested_attributes_for(name) {
					assigner.assign(self, name, value)?;
					continue;
				}
			}
			if let Some(reflection) = class.reflect_on(key) {
				self.assign_association_params(store, &reflection, value)?;
				continue;
			}
			if class.has_attribute(key) {
				self.set(key, value.clone());
				continue;
			}
			tracing::trace!(parameter = %key, class = class.name(), "ignoring unknown parameter");
		}
		Ok(())
	}

	/// Association writer fed from raw parameters: a map builds and
	/// assigns a singular target, a list of maps replaces a collection.
	fn assign_association_params(
		&self,
		store: &dyn Store,
		reflection: &Arc<Reflection>,
		value: &Value,
	) -> FormResult<()> {
		match (reflection.kind(), value) {
			(AssociationKind::HasOne, Value::Null) => self.set_related(reflection.name(), None),
			(AssociationKind::HasOne, Value::Object(map)) => {
				self.build_related(store, reflection.name(), object_to_attributes(map))?;
				Ok(())
			}
			(AssociationKind::HasMany, Value::Array(entries)) => {
				let target_class = reflection.target_class()?;
				let mut records = Vec::with_capacity(entries.len());
				for entry in entries {
					let Value::Object(map) = entry else {
						return Err(FormError::InvalidPayload {
							association: reflection.name().to_string(),
							detail: format!("expected a map of attributes, got {entry}"),
						});
					};
					records.push(store.build(&target_class, &object_to_attributes(map)));
				}
				self.association(reflection.name())?
					.write()
					.replace(self, store, records)
			}
			_ => Err(FormError::InvalidPayload {
				association: reflection.name().to_string(),
				detail: format!("unsupported association parameter shape: {value}"),
			}),
		}
	}
}

/// Build a record of `class` from a raw parameter map.
///
/// When the class declares variants and the parameters carry a non-blank
/// variant tag, the record is built as the tagged subtype; unknown tags
/// fail with `UnknownVariant`.
pub fn from_params(
	store: &dyn Store,
	class: &Arc<ClassDescriptor>,
	params: &Map<String, Value>,
) -> FormResult<Record> {
	let resolved = match params.get(class.variant_attribute()) {
		Some(tag) if class.has_variants() && !is_blank(tag) => {
			let tag = tag.as_str().ok_or_else(|| FormError::UnknownVariant {
				tag: tag.to_string(),
				base: class.name().to_string(),
			})?;
			class.resolve_variant(tag)?
		}
		_ => class.clone(),
	};

	let record = Record::new(resolved);
	record.assign_params(store, params)?;
	Ok(record)
}
