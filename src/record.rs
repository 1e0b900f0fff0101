//! Attribute-bearing form records.
//!
//! A [`Record`] is a cheaply cloneable handle to one form object: its
//! attribute map with changed-name tracking, its destruction mark, its
//! error collection, and its lazily created per-association state. Handles
//! share the underlying object, so the engine can hold the same logical
//! record in an association target, a nested-attribute resolution, and an
//! error report without copying state around.
//!
//! Identity is surrogate-keyed: a persisted record is identified by its
//! positive integer `id`, an unsaved one by a process-unique temporary
//! key. All membership and diff operations in the association machinery
//! compare these keys, never object equality.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde_json::Value;

use crate::associations::{Association, CollectionProxy, SharedAssociation};
use crate::error::{FormError, FormResult, RecordId};
use crate::registry::ClassDescriptor;
use crate::reflection::AssociationKind;
use crate::store::Store;
use crate::validation::{ErrorProjector, Errors};
use crate::value::{AttributeMap, id_of};

static NEXT_TEMP_KEY: AtomicU64 = AtomicU64::new(1);

/// Stable surrogate identity of a record: its persisted id, or a
/// process-unique temporary key while unsaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
	Persisted(RecordId),
	Temp(u64),
}

#[derive(Debug)]
struct RecordState {
	attributes: AttributeMap,
	changed: IndexSet<String>,
	marked_for_destruction: bool,
	errors: Errors,
}

struct RecordShared {
	class: Arc<ClassDescriptor>,
	temp_key: u64,
	state: RwLock<RecordState>,
	associations: RwLock<IndexMap<String, SharedAssociation>>,
}

/// Handle to one form record. Clones share the same underlying object.
#[derive(Clone)]
pub struct Record {
	shared: Arc<RecordShared>,
}

/// Non-owning record handle, used for inverse links.
#[derive(Clone)]
pub struct WeakRecord {
	shared: Weak<RecordShared>,
}

impl WeakRecord {
	pub fn upgrade(&self) -> Option<Record> {
		self.shared.upgrade().map(|shared| Record { shared })
	}
}

impl std::fmt::Debug for WeakRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.upgrade() {
			Some(record) => write!(f, "WeakRecord({:?})", record.key()),
			None => f.write_str("WeakRecord(dropped)"),
		}
	}
}

impl std::fmt::Debug for Record {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Derive the key from the already-held state guard; key() would
		// re-enter the lock.
		let state = self.shared.state.read();
		let key = match state.attributes.get("id").and_then(id_of) {
			Some(id) => RecordKey::Persisted(id),
			None => RecordKey::Temp(self.shared.temp_key),
		};
		f.debug_struct("Record")
			.field("class", &self.shared.class.name())
			.field("key", &key)
			.field("attributes", &state.attributes)
			.field("marked_for_destruction", &state.marked_for_destruction)
			.finish()
	}
}

impl Record {
	/// Construct a record of the given class with its declared attribute
	/// defaults. The record starts unpersisted and unchanged.
	pub fn new(class: Arc<ClassDescriptor>) -> Self {
		let attributes = class.attributes().clone();
		Self {
			shared: Arc::new(RecordShared {
				class,
				temp_key: NEXT_TEMP_KEY.fetch_add(1, Ordering::Relaxed),
				state: RwLock::new(RecordState {
					attributes,
					changed: IndexSet::new(),
					marked_for_destruction: false,
					errors: Errors::new(),
				}),
				associations: RwLock::new(IndexMap::new()),
			}),
		}
	}

	pub fn class(&self) -> Arc<ClassDescriptor> {
		self.shared.class.clone()
	}

	/// Whether the two handles point at the same underlying object.
	pub fn same_record(&self, other: &Record) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}

	pub fn downgrade(&self) -> WeakRecord {
		WeakRecord {
			shared: Arc::downgrade(&self.shared),
		}
	}

	pub(crate) fn addr(&self) -> usize {
		Arc::as_ptr(&self.shared) as usize
	}

	// --- attributes ----------------------------------------------------

	pub fn get(&self, name: &str) -> Option<Value> {
		self.shared.state.read().attributes.get(name).cloned()
	}

	/// Assign an attribute, recording it as changed when the value
	/// actually differs.
	pub fn set(&self, name: &str, value: Value) {
		let mut state = self.shared.state.write();
		let differs = state.attributes.get(name) != Some(&value);
		state.attributes.insert(name.to_string(), value);
		if differs {
			state.changed.insert(name.to_string());
		}
	}

	/// Overwrite an attribute with a store-fresh value without recording a
	/// change; the merge algorithm uses this to refresh unedited
	/// attributes.
	pub(crate) fn refresh(&self, name: &str, value: Value) {
		let mut state = self.shared.state.write();
		state.attributes.insert(name.to_string(), value);
		state.changed.shift_remove(name);
	}

	pub fn attributes(&self) -> AttributeMap {
		self.shared.state.read().attributes.clone()
	}

	pub fn attribute_names(&self) -> Vec<String> {
		self.shared.state.read().attributes.keys().cloned().collect()
	}

	pub fn has_attribute(&self, name: &str) -> bool {
		self.shared.state.read().attributes.contains_key(name)
	}

	/// Names assigned since construction or the last `clear_changes`.
	pub fn changed_attribute_names(&self) -> IndexSet<String> {
		self.shared.state.read().changed.clone()
	}

	pub fn is_changed(&self) -> bool {
		!self.shared.state.read().changed.is_empty()
	}

	/// Forget change tracking, e.g. after the store has written the
	/// record.
	pub fn clear_changes(&self) {
		self.shared.state.write().changed.clear();
	}

	/// Assign several attributes at once.
	pub fn assign_attributes(&self, attributes: &AttributeMap) {
		for (name, value) in attributes {
			self.set(name, value.clone());
		}
	}

	// --- identity ------------------------------------------------------

	/// Persisted identity: the `id` attribute as a positive integer.
	pub fn identity(&self) -> Option<RecordId> {
		self.get("id").as_ref().and_then(id_of)
	}

	pub fn is_persisted(&self) -> bool {
		self.identity().is_some()
	}

	pub fn is_new_record(&self) -> bool {
		!self.is_persisted()
	}

	/// Surrogate key used for membership and diff operations.
	pub fn key(&self) -> RecordKey {
		match self.identity() {
			Some(id) => RecordKey::Persisted(id),
			None => RecordKey::Temp(self.shared.temp_key),
		}
	}

	// --- destruction mark ----------------------------------------------

	/// Flag the record for removal on the owner's save cascade. The
	/// record stays in its association target until then.
	pub fn mark_for_destruction(&self) {
		self.shared.state.write().marked_for_destruction = true;
	}

	pub fn is_marked_for_destruction(&self) -> bool {
		self.shared.state.read().marked_for_destruction
	}

	// --- errors --------------------------------------------------------

	pub fn errors(&self) -> Errors {
		self.shared.state.read().errors.clone()
	}

	pub fn add_error(&self, attribute: impl Into<String>, message: impl Into<String>) {
		self.shared.state.write().errors.add(attribute, message);
	}

	pub fn clear_errors(&self) {
		self.shared.state.write().errors.clear();
	}

	fn put_errors(&self, errors: Errors) {
		self.shared.state.write().errors = errors;
	}

	// --- associations --------------------------------------------------

	/// The per-owner association state for `name`, created on first
	/// access.
	pub fn association(&self, name: &str) -> FormResult<SharedAssociation> {
		if let Some(existing) = self.shared.associations.read().get(name) {
			return Ok(existing.clone());
		}
		let reflection = self
			.shared
			.class
			.reflect_on(name)
			.ok_or_else(|| FormError::UnknownAssociation(name.to_string()))?;
		let mut associations = self.shared.associations.write();
		// Another handle may have created it between the locks.
		if let Some(existing) = associations.get(name) {
			return Ok(existing.clone());
		}
		let association = Arc::new(RwLock::new(Association::new(reflection)?));
		associations.insert(name.to_string(), association.clone());
		Ok(association)
	}

	/// The association state for `name` only if it has been touched
	/// already; the validation cascade uses this so that validating an
	/// owner never instantiates associations it has not used.
	pub fn association_if_cached(&self, name: &str) -> Option<SharedAssociation> {
		self.shared.associations.read().get(name).cloned()
	}

	/// Whether the named association has loaded its target.
	pub fn association_is_loaded(&self, name: &str) -> bool {
		self.association_if_cached(name)
			.is_some_and(|association| association.read().is_loaded())
	}

	/// Drop the named association's target and bookkeeping.
	pub fn reset_association(&self, name: &str) -> FormResult<()> {
		self.association(name)?.write().reset();
		Ok(())
	}

	/// Drop and refetch the named association's target.
	pub fn reload_association(&self, store: &dyn Store, name: &str) -> FormResult<()> {
		self.association(name)?.write().reload(self, store)
	}

	// --- singular accessors --------------------------------------------

	/// Reader for a singular association: the target, fetched lazily.
	pub fn related(&self, store: &dyn Store, name: &str) -> FormResult<Option<Record>> {
		self.association(name)?.write().load_singular(self, store)
	}

	/// Writer for a singular association.
	pub fn set_related(&self, name: &str, target: Option<Record>) -> FormResult<()> {
		self.association(name)?.write().assign_singular(self, target)
	}

	/// Build an unpersisted target for a singular association.
	pub fn build_related(
		&self,
		store: &dyn Store,
		name: &str,
		attributes: AttributeMap,
	) -> FormResult<Record> {
		self.association(name)?
			.write()
			.build_singular(self, store, &attributes)
	}

	// --- collection accessor -------------------------------------------

	/// Reader for a collection association: a live proxy over the target.
	pub fn collection(&self, name: &str) -> FormResult<CollectionProxy> {
		let reflection = self
			.shared
			.class
			.reflect_on(name)
			.ok_or_else(|| FormError::UnknownAssociation(name.to_string()))?;
		if !reflection.is_collection() {
			return Err(FormError::KindMismatch {
				name: name.to_string(),
				expected: AssociationKind::HasMany,
			});
		}
		Ok(CollectionProxy::new(self.clone(), name.to_string()))
	}

	// --- validation ----------------------------------------------------

	/// Run the class validators, cascade into every association declared
	/// with `validate`/`autosave`, and project child failures onto this
	/// record's error collection. Returns whether the record is valid;
	/// failures are reported through `errors`, never raised.
	pub fn validate(&self, store: &dyn Store) -> bool {
		let mut visited = IndexSet::new();
		self.validate_inner(store, &mut visited)
	}

	fn validate_inner(&self, store: &dyn Store, visited: &mut IndexSet<usize>) -> bool {
		// Inverse links make owner/child validation mutually recursive;
		// a record already in this pass counts as valid here.
		if !visited.insert(self.addr()) {
			return true;
		}

		let class = self.class();
		let mut errors = Errors::new();
		let attributes = self.attributes();
		for validator in class.validators() {
			validator.run(&attributes, &mut errors);
		}

		for (name, reflection) in class.reflections() {
			if !reflection.validates_target() {
				continue;
			}
			let Some(association) = self.association_if_cached(name) else {
				continue;
			};
			let autosave = reflection.options().autosave;

			match reflection.kind() {
				AssociationKind::HasOne => {
					let target = match association.write().load_singular(self, store) {
						Ok(target) => target,
						Err(err) => {
							tracing::warn!(association = %name, error = %err, "skipping association validation");
							continue;
						}
					};
					if let Some(child) = target {
						if autosave && child.is_marked_for_destruction() {
							continue;
						}
						if !child.validate_inner(store, visited) {
							ErrorProjector::project(&mut errors, reflection.as_ref(), &child.errors(), None);
						}
					}
				}
				AssociationKind::HasMany => {
					if self.is_persisted() {
						if let Err(err) = association.write().load_collection(self, store, false) {
							tracing::warn!(association = %name, error = %err, "skipping association validation");
							continue;
						}
					}
					let records = association.read().target_records();
					for (index, child) in records.iter().enumerate() {
						if autosave && child.is_marked_for_destruction() {
							continue;
						}
						if !child.validate_inner(store, visited) {
							ErrorProjector::project(&mut errors, reflection.as_ref(), &child.errors(), Some(index));
						}
					}
				}
			}
		}

		errors.dedup();
		let valid = errors.is_empty();
		self.put_errors(errors);
		valid
	}

	/// `validate` with the polarity callers of "is this form invalid?"
	/// expect.
	pub fn is_invalid(&self, store: &dyn Store) -> bool {
		!self.validate(store)
	}
}
