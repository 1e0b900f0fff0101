//! Nested-attribute assignment.
//!
//! A nested payload is a map (one-to-one) or a list/map of maps
//! (one-to-many) of raw attribute values that also drives building,
//! updating, and destroy-marking of associated records through the owner.
//! [`NestedAttributesOptions`] is the per-association configuration
//! attached at declaration time; [`NestedAttributesAssigner`] resolves
//! payloads against the owner's associations.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{FormError, FormResult};
use crate::record::Record;
use crate::reflection::{AssociationKind, Reflection};
use crate::store::Store;
use crate::value::{AttributeMap, id_of, id_string, is_blank, is_truthy, object_to_attributes};

/// Payload key that flags an entry for destruction.
pub const DESTROY_KEY: &str = "_destroy";

/// Payload keys that are never copied onto a record's attributes.
pub const UNASSIGNABLE_KEYS: &[&str] = &["id", DESTROY_KEY];

/// Predicate deciding whether a payload entry should be ignored.
pub type RejectPredicate = Arc<dyn Fn(&AttributeMap) -> bool + Send + Sync>;

/// Rule producing the maximum accepted collection payload size.
pub type LimitPredicate = Arc<dyn Fn() -> usize + Send + Sync>;

/// Rejection rule for nested payload entries.
#[derive(Clone)]
pub enum RejectRule {
	/// Ignore entries whose every non-destroy value is blank.
	AllBlank,
	/// An inline predicate over the payload entry.
	Rule(RejectPredicate),
	/// A predicate registered on the owner's class under this name.
	Named(String),
}

impl std::fmt::Debug for RejectRule {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RejectRule::AllBlank => f.write_str("AllBlank"),
			RejectRule::Rule(_) => f.write_str("Rule(..)"),
			RejectRule::Named(name) => f.debug_tuple("Named").field(name).finish(),
		}
	}
}

/// Limit rule for nested collection payloads.
#[derive(Clone)]
pub enum LimitRule {
	/// A fixed maximum.
	Count(usize),
	/// An inline rule computing the maximum.
	Rule(LimitPredicate),
	/// A rule registered on the owner's class under this name.
	Named(String),
}

impl std::fmt::Debug for LimitRule {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			LimitRule::Count(n) => f.debug_tuple("Count").field(n).finish(),
			LimitRule::Rule(_) => f.write_str("Rule(..)"),
			LimitRule::Named(name) => f.debug_tuple("Named").field(name).finish(),
		}
	}
}

/// Per-association nested-attribute configuration, immutable and
/// class-level.
#[derive(Debug, Clone, Default)]
pub struct NestedAttributesOptions {
	/// Honor destroy flags in payload entries.
	pub allow_destroy: bool,
	/// Rejection rule for payload entries.
	pub reject_if: Option<RejectRule>,
	/// Maximum accepted collection payload size.
	pub limit: Option<LimitRule>,
	/// For one-to-one associations, always update the existing target
	/// instead of requiring a matching id.
	pub update_only: bool,
}

impl NestedAttributesOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn allow_destroy(mut self, enabled: bool) -> Self {
		self.allow_destroy = enabled;
		self
	}

	pub fn reject_if(mut self, rule: RejectRule) -> Self {
		self.reject_if = Some(rule);
		self
	}

	pub fn limit(mut self, rule: LimitRule) -> Self {
		self.limit = Some(rule);
		self
	}

	pub fn update_only(mut self, enabled: bool) -> Self {
		self.update_only = enabled;
		self
	}
}

/// Resolves nested payloads against an owner's associations, performing
/// build/update/destroy-mark/reject decisions.
///
/// Structural violations (unknown ids, exceeded limits, malformed
/// payloads) abort the whole batch; nothing is partially applied after the
/// failing entry.
pub struct NestedAttributesAssigner<'a> {
	store: &'a dyn Store,
}

impl<'a> NestedAttributesAssigner<'a> {
	pub fn new(store: &'a dyn Store) -> Self {
		Self { store }
	}

	/// Assign a nested payload to the named association of `owner`.
	///
	/// The association must have nested attributes declared on the owner's
	/// class; the payload shape must match the association's cardinality.
	pub fn assign(&self, owner: &Record, name: &str, payload: &Value) -> FormResult<()> {
		let class = owner.class();
		let reflection = class
			.reflect_on(name)
			.ok_or_else(|| FormError::UnknownAssociation(name.to_string()))?;
		let options = class
			.nested_options_for(name)
			.ok_or_else(|| FormError::UnknownAssociation(name.to_string()))?;

		tracing::debug!(association = name, kind = %reflection.kind(), "assigning nested attributes");

		match reflection.kind() {
			AssociationKind::HasOne => self.assign_one_to_one(owner, &reflection, &options, payload),
			AssociationKind::HasMany => self.assign_collection(owner, &reflection, &options, payload),
		}
	}

	fn assign_one_to_one(
		&self,
		owner: &Record,
		reflection: &Arc<Reflection>,
		options: &NestedAttributesOptions,
		payload: &Value,
	) -> FormResult<()> {
		let attributes = as_entry(payload).ok_or_else(|| FormError::InvalidPayload {
			association: reflection.name().to_string(),
			detail: format!("expected a map of attributes, got {payload}"),
		})?;

		let association = owner.association(reflection.name())?;
		let existing = association.write().load_singular(owner, self.store)?;

		let payload_id = attributes.get("id").and_then(id_string);
		let existing_id = existing
			.as_ref()
			.and_then(|record| record.identity())
			.map(|id| id.to_string());

		let updates_existing = existing.is_some()
			&& (options.update_only || (payload_id.is_some() && payload_id == existing_id));

		if updates_existing {
			let record = existing.as_ref().unwrap();
			if !self.call_reject_if(owner, options, &attributes) {
				self.assign_or_mark_for_destruction(record, &attributes, options.allow_destroy);
			}
		} else if let Some(id) = payload_id {
			return Err(FormError::NestedRecordNotFound {
				class_name: reflection.class_name().to_string(),
				owner: owner.class().name().to_string(),
				id,
			});
		} else if !self.reject_new_record(owner, options, &attributes) {
			let assignable = assignable_attributes(&attributes);
			match existing {
				// An unsaved target built ahead of assignment is updated,
				// not replaced.
				Some(record) if record.is_new_record() => {
					apply_attributes(&record, &assignable);
					association.write().link_inverse(owner, &record);
				}
				_ => {
					let target_class = reflection.target_class()?;
					let record = self.store.build(&target_class, &assignable);
					association.write().assign_singular(owner, Some(record))?;
				}
			}
		}

		Ok(())
	}

	fn assign_collection(
		&self,
		owner: &Record,
		reflection: &Arc<Reflection>,
		options: &NestedAttributesOptions,
		payload: &Value,
	) -> FormResult<()> {
		let entries = normalize_collection(reflection.name(), payload)?;
		self.check_record_limit(owner, options, entries.len())?;

		let association = owner.association(reflection.name())?;

		// Resolve payload ids against records the association has not
		// loaded yet in one query instead of one-by-one.
		let prefetched = {
			let (loaded, scope) = {
				let guard = association.read();
				(guard.is_loaded(), guard.scope(owner))
			};
			let ids: Vec<_> = entries
				.iter()
				.filter_map(|attrs| attrs.get("id").and_then(id_of))
				.collect();
			if loaded || ids.is_empty() {
				Vec::new()
			} else {
				scope.find_existing(self.store, &ids)?
			}
		};

		for attributes in &entries {
			// A blank id means "new record"; id_string already yields
			// nothing for empty and non-scalar values.
			let payload_id = attributes.get("id").and_then(id_string);

			match payload_id {
				None => {
					if !self.reject_new_record(owner, options, attributes) {
						let target_class = reflection.target_class()?;
						let record = self.store.build(&target_class, &assignable_attributes(attributes));
						association.write().add_to_target(owner, record, true);
					}
				}
				Some(id) => {
					if self.call_reject_if(owner, options, attributes) {
						continue;
					}
					let in_target = association.read().target_by_id(&id);
					let record = match in_target {
						Some(record) => record,
						None => {
							// Not among loaded records: splice the
							// prefetched row in as a replace placeholder
							// before attributes apply.
							let found = prefetched
								.iter()
								.find(|record| {
									record.identity().map(|i| i.to_string()).as_deref() == Some(id.as_str())
								})
								.cloned();
							match found {
								Some(record) => {
									association.write().add_to_target(owner, record.clone(), true);
									record
								}
								None => {
									return Err(FormError::NestedRecordNotFound {
										class_name: reflection.class_name().to_string(),
										owner: owner.class().name().to_string(),
										id,
									});
								}
							}
						}
					};
					self.assign_or_mark_for_destruction(&record, attributes, options.allow_destroy);
				}
			}
		}

		Ok(())
	}

	/// Apply `attributes` to `record`, or mark it for later destruction
	/// when the destroy flag is set and destruction is allowed. Removal is
	/// deferred: the record stays in the target with the flag set until
	/// the owner's save cascade runs.
	fn assign_or_mark_for_destruction(
		&self,
		record: &Record,
		attributes: &AttributeMap,
		allow_destroy: bool,
	) {
		apply_attributes(record, &assignable_attributes(attributes));
		if has_destroy_flag(attributes) && allow_destroy {
			record.mark_for_destruction();
		}
	}

	/// A new (blank-id) entry is dropped when it is flagged for
	/// destruction, or when the reject rule says so.
	fn reject_new_record(
		&self,
		owner: &Record,
		options: &NestedAttributesOptions,
		attributes: &AttributeMap,
	) -> bool {
		self.will_be_destroyed(options, attributes) || self.call_reject_if(owner, options, attributes)
	}

	/// Entries about to be destroyed bypass the reject rule, otherwise a
	/// destroy-only payload could never reach its record.
	fn call_reject_if(
		&self,
		owner: &Record,
		options: &NestedAttributesOptions,
		attributes: &AttributeMap,
	) -> bool {
		if self.will_be_destroyed(options, attributes) {
			return false;
		}
		match &options.reject_if {
			None => false,
			Some(RejectRule::AllBlank) => attributes
				.iter()
				.all(|(key, value)| key == DESTROY_KEY || is_blank(value)),
			Some(RejectRule::Rule(rule)) => rule(attributes),
			Some(RejectRule::Named(name)) => match owner.class().named_rule(name) {
				Some(rule) => rule(attributes),
				None => {
					tracing::warn!(rule = %name, "named reject rule is not registered; entry kept");
					false
				}
			},
		}
	}

	fn will_be_destroyed(&self, options: &NestedAttributesOptions, attributes: &AttributeMap) -> bool {
		options.allow_destroy && has_destroy_flag(attributes)
	}

	fn check_record_limit(
		&self,
		owner: &Record,
		options: &NestedAttributesOptions,
		got: usize,
	) -> FormResult<()> {
		let limit = match &options.limit {
			None => return Ok(()),
			Some(LimitRule::Count(n)) => Some(*n),
			Some(LimitRule::Rule(rule)) => Some(rule()),
			Some(LimitRule::Named(name)) => owner.class().named_count(name).map(|rule| rule()),
		};
		match limit {
			Some(limit) if got > limit => Err(FormError::TooManyRecords { limit, got }),
			_ => Ok(()),
		}
	}
}

/// Whether the payload entry carries a truthy destroy flag.
pub fn has_destroy_flag(attributes: &AttributeMap) -> bool {
	attributes.get(DESTROY_KEY).is_some_and(is_truthy)
}

/// The payload entry minus `id` and the destroy flag.
fn assignable_attributes(attributes: &AttributeMap) -> AttributeMap {
	attributes
		.iter()
		.filter(|(key, _)| !UNASSIGNABLE_KEYS.contains(&key.as_str()))
		.map(|(key, value)| (key.clone(), value.clone()))
		.collect()
}

fn apply_attributes(record: &Record, attributes: &AttributeMap) {
	for (key, value) in attributes {
		record.set(key, value.clone());
	}
}

fn as_entry(payload: &Value) -> Option<AttributeMap> {
	match payload {
		Value::Object(map) => Some(object_to_attributes(map)),
		_ => None,
	}
}

/// Normalize a collection payload into a list of attribute maps.
///
/// A map of maps is flattened to its values with the outer keys ignored,
/// unless one of the outer keys is itself `id`, in which case the whole
/// map is one record payload (the form-parameter ambiguity guard).
fn normalize_collection(association: &str, payload: &Value) -> FormResult<Vec<AttributeMap>> {
	match payload {
		Value::Array(list) => list
			.iter()
			.map(|entry| {
				as_entry(entry).ok_or_else(|| FormError::InvalidPayload {
					association: association.to_string(),
					detail: format!("expected a map of attributes, got {entry}"),
				})
			})
			.collect(),
		Value::Object(map) => {
			if map.keys().any(|key| key == "id") {
				Ok(vec![object_to_attributes(map)])
			} else {
				map.values()
					.map(|entry| {
						as_entry(entry).ok_or_else(|| FormError::InvalidPayload {
							association: association.to_string(),
							detail: format!("expected a map of attributes, got {entry}"),
						})
					})
					.collect()
			}
		}
		other => Err(FormError::InvalidPayload {
			association: association.to_string(),
			detail: format!("expected a list or map of attribute maps, got {other}"),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn entry(value: Value) -> AttributeMap {
		as_entry(&value).expect("map payload")
	}

	#[test]
	fn test_destroy_flag_detection() {
		assert!(has_destroy_flag(&entry(json!({"_destroy": "1"}))));
		assert!(has_destroy_flag(&entry(json!({"_destroy": true}))));
		assert!(!has_destroy_flag(&entry(json!({"_destroy": "0"}))));
		assert!(!has_destroy_flag(&entry(json!({"name": "x"}))));
	}

	#[test]
	fn test_assignable_attributes_strips_bookkeeping_keys() {
		let attrs = assignable_attributes(&entry(json!({"id": "2", "_destroy": "1", "name": "x"})));
		assert_eq!(attrs.len(), 1);
		assert_eq!(attrs.get("name"), Some(&json!("x")));
	}

	#[test]
	fn test_normalize_map_of_maps_ignores_outer_keys() {
		let payload = json!({"first": {"title": "Foo"}, "second": {"title": "Bar"}});
		let entries = normalize_collection("posts", &payload).unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].get("title"), Some(&json!("Foo")));
	}

	#[test]
	fn test_normalize_map_with_id_key_is_single_payload() {
		let payload = json!({"id": "2", "title": "Foo"});
		let entries = normalize_collection("posts", &payload).unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].get("id"), Some(&json!("2")));
	}

	#[test]
	fn test_normalize_rejects_scalars() {
		assert!(matches!(
			normalize_collection("posts", &json!("nope")),
			Err(FormError::InvalidPayload { .. })
		));
	}
}
