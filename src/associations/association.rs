//! Per-owner association state machine.
//!
//! An [`Association`] wraps one shared [`Reflection`] together with the
//! owner-local target state: the lazily loaded record(s), the loaded flag,
//! and staleness bookkeeping. Cardinality-specific behavior lives in the
//! [`SingularAssociation`] and [`CollectionAssociation`] strategies; the
//! association dispatches to whichever its reflection declares and rejects
//! operations of the wrong cardinality with `KindMismatch`.
//!
//! Storage is never touched directly: every operation that may fetch or
//! persist takes the storage collaborator as an argument.

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::RwLock;
use serde_json::json;

use crate::error::{FormError, FormResult, RecordId, StoreError};
use crate::record::Record;
use crate::reflection::{AssociationKind, Reflection};
use crate::store::{AssociationScope, RemovalMode, Store};
use crate::value::AttributeMap;

use super::collection::{CollectionAssociation, identity_sequence, merge_target_lists};
use super::singular::SingularAssociation;

/// Shared handle to one owner's association, as cached on the owner.
pub type SharedAssociation = Arc<RwLock<Association>>;

#[derive(Debug)]
enum Strategy {
	Singular(SingularAssociation),
	Collection(CollectionAssociation),
}

/// One owner's view of one declared association.
#[derive(Debug)]
pub struct Association {
	reflection: Arc<Reflection>,
	strategy: Strategy,
}

impl Association {
	pub(crate) fn new(reflection: Arc<Reflection>) -> FormResult<Self> {
		reflection.check_validity()?;
		let strategy = match reflection.kind() {
			AssociationKind::HasOne => Strategy::Singular(SingularAssociation::new()),
			AssociationKind::HasMany => Strategy::Collection(CollectionAssociation::new()),
		};
		Ok(Self { reflection, strategy })
	}

	pub fn reflection(&self) -> &Arc<Reflection> {
		&self.reflection
	}

	pub fn is_loaded(&self) -> bool {
		match &self.strategy {
			Strategy::Singular(s) => s.is_loaded(),
			Strategy::Collection(c) => c.is_loaded(),
		}
	}

	/// Loaded under a different owner identity than the owner has now.
	pub fn is_stale(&self, owner: &Record) -> bool {
		match &self.strategy {
			Strategy::Singular(s) => s.is_stale(owner.identity()),
			Strategy::Collection(c) => c.is_stale(owner.identity()),
		}
	}

	/// Drop the target and all load bookkeeping. Idempotent.
	pub fn reset(&mut self) {
		match &mut self.strategy {
			Strategy::Singular(s) => s.reset(),
			Strategy::Collection(c) => c.reset(),
		}
	}

	/// Query surface for this association's related records.
	pub fn scope(&self, owner: &Record) -> AssociationScope {
		AssociationScope::new(
			self.reflection.class_name(),
			self.reflection.foreign_key(),
			owner.identity(),
		)
	}

	/// Fail with `TypeMismatch` unless `record` belongs to the
	/// reflection's class or one of its registered subtypes.
	pub fn type_mismatch_check(&self, record: &Record) -> FormResult<()> {
		check_record_type(&self.reflection, record)
	}

	pub(crate) fn link_inverse(&self, owner: &Record, record: &Record) {
		link_inverse(&self.reflection, owner, record);
	}

	// --- singular operations -------------------------------------------

	/// Return the singular target, fetching only when unloaded or stale.
	///
	/// A fetch that finds nothing is a normal state: the target becomes
	/// empty and the association counts as loaded.
	pub fn load_singular(&mut self, owner: &Record, store: &dyn Store) -> FormResult<Option<Record>> {
		let scope = self.scope(owner);
		let reflection = self.reflection.clone();
		let singular = self.singular_mut()?;

		if singular.is_loaded() && !singular.is_stale(owner.identity()) {
			return Ok(singular.target());
		}

		if owner.identity().is_none() {
			// Nothing to query for an unpersisted owner; whatever was
			// assigned in memory is the target.
			singular.mark_loaded(owner.identity());
			return Ok(singular.target());
		}

		tracing::debug!(association = reflection.name(), "loading singular target");
		match store.find(&scope, None) {
			Ok(records) => {
				let target = records.into_iter().next();
				if let Some(record) = &target {
					link_inverse(&reflection, owner, record);
				}
				let singular = self.singular_mut()?;
				singular.set_target(target.clone(), owner.identity());
				Ok(target)
			}
			Err(StoreError::NotFound { .. }) => {
				let singular = self.singular_mut()?;
				singular.set_target(None, owner.identity());
				Ok(None)
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Current singular target without touching storage.
	pub fn singular_target(&self) -> FormResult<Option<Record>> {
		match &self.strategy {
			Strategy::Singular(s) => Ok(s.target()),
			Strategy::Collection(_) => Err(self.kind_mismatch(AssociationKind::HasOne)),
		}
	}

	/// Replace the singular target and point any declared inverse
	/// association on the new target back at the owner.
	pub fn assign_singular(&mut self, owner: &Record, target: Option<Record>) -> FormResult<()> {
		if let Some(record) = &target {
			self.type_mismatch_check(record)?;
		}
		let reflection = self.reflection.clone();
		let identity = owner.identity();
		let singular = self.singular_mut()?;
		singular.set_target(target.clone(), identity);
		if let Some(record) = &target {
			link_inverse(&reflection, owner, record);
		}
		Ok(())
	}

	/// Construct an unpersisted target via the store's construction
	/// protocol and assign it. Never persists.
	pub fn build_singular(
		&mut self,
		owner: &Record,
		store: &dyn Store,
		attributes: &AttributeMap,
	) -> FormResult<Record> {
		let target_class = self.reflection.target_class()?;
		let record = store.build(&target_class, attributes);
		self.assign_singular(owner, Some(record.clone()))?;
		Ok(record)
	}

	/// Install a non-owning back-reference to the record on the other
	/// side of an inverse link.
	pub(crate) fn set_back_reference(&mut self, holder_identity: Option<RecordId>, other: &Record) {
		if let Strategy::Singular(s) = &mut self.strategy {
			s.set_back_reference(other.downgrade(), holder_identity);
		}
	}

	// --- collection operations -----------------------------------------

	/// Ensure the collection target is loaded, merging fetched rows with
	/// whatever is in memory.
	pub fn load_collection(&mut self, owner: &Record, store: &dyn Store, force: bool) -> FormResult<()> {
		let scope = self.scope(owner);
		let reflection = self.reflection.clone();
		let identity = owner.identity();

		{
			let collection = self.collection_mut()?;
			if collection.is_loaded() && !collection.is_stale(identity) && !force {
				return Ok(());
			}
			if identity.is_none() {
				collection.mark_loaded(identity);
				return Ok(());
			}
		}

		tracing::debug!(association = reflection.name(), force, "loading collection target");
		let fetched = match store.find(&scope, None) {
			Ok(records) => records,
			Err(StoreError::NotFound { .. }) => Vec::new(),
			Err(err) => return Err(err.into()),
		};
		for record in &fetched {
			link_inverse(&reflection, owner, record);
		}

		let collection = self.collection_mut()?;
		let memory = collection.take_target();
		let merged = merge_target_lists(fetched, memory);
		collection.set_merged_target(merged, identity);
		Ok(())
	}

	/// Live snapshot of the collection target's record handles.
	pub fn target_records(&self) -> Vec<Record> {
		match &self.strategy {
			Strategy::Singular(s) => s.target().into_iter().collect(),
			Strategy::Collection(c) => c.records(),
		}
	}

	/// Target member whose persisted identity matches `id`.
	pub fn target_by_id(&self, id: &str) -> Option<Record> {
		match &self.strategy {
			Strategy::Singular(_) => None,
			Strategy::Collection(c) => c.find_by_id_string(id),
		}
	}

	/// Insert-or-replace a record in the collection target, linking the
	/// inverse association. Never touches storage.
	pub fn add_to_target(&mut self, owner: &Record, record: Record, replace: bool) -> Record {
		self.link_inverse(owner, &record);
		match &mut self.strategy {
			Strategy::Collection(c) => c.replace_on_target(record, replace),
			// Singular associations have no list to splice into; the
			// record becomes the target.
			Strategy::Singular(s) => {
				s.set_target(Some(record.clone()), owner.identity());
				record
			}
		}
	}

	/// Construct one unpersisted record, apply `attributes`, and append it
	/// to the target. Never persists.
	pub fn build_collection(
		&mut self,
		owner: &Record,
		store: &dyn Store,
		attributes: &AttributeMap,
	) -> FormResult<Record> {
		let target_class = self.reflection.target_class()?;
		let record = store.build(&target_class, attributes);
		self.collection_mut()?;
		Ok(self.add_to_target(owner, record, true))
	}

	/// Replace the whole collection with `new_list`, diffing by identity.
	///
	/// Records present in both lists are updated in their existing slots.
	/// For an unpersisted owner the replace is purely in-memory. For a
	/// persisted owner with an identity diff, removals and insertions run
	/// inside one atomic batch; when that batch fails the in-memory target
	/// is rolled back to its pre-operation snapshot and the operation
	/// fails with `NotSaved`.
	pub fn replace(&mut self, owner: &Record, store: &dyn Store, new_list: Vec<Record>) -> FormResult<()> {
		for record in &new_list {
			self.type_mismatch_check(record)?;
		}
		self.load_collection(owner, store, false)?;

		let reflection = self.reflection.clone();
		let identity = owner.identity();
		let original = self.collection_mut()?.records();

		// Common records keep their slots; the incoming handle wins.
		let original_keys: IndexSet<_> = identity_sequence(&original).into_iter().collect();
		for record in &new_list {
			if original_keys.contains(&record.key()) {
				self.link_inverse(owner, record);
				self.collection_mut()?.replace_on_target(record.clone(), true);
			}
		}

		if owner.is_new_record() {
			self.install_target(owner, new_list);
			return Ok(());
		}

		if identity_sequence(&new_list) == identity_sequence(&original) {
			// Equal by identity sequence: nothing to persist, no batch.
			return Ok(());
		}

		let new_keys: IndexSet<_> = identity_sequence(&new_list).into_iter().collect();
		let to_remove: Vec<Record> = original
			.iter()
			.filter(|record| !new_keys.contains(&record.key()) && record.is_persisted())
			.cloned()
			.collect();
		let to_add: Vec<Record> = new_list
			.iter()
			.filter(|record| !original_keys.contains(&record.key()))
			.cloned()
			.collect();

		let scope = self.scope(owner);
		let outcome = store.within_transaction(&mut |tx| {
			if !to_remove.is_empty() {
				tx.delete_or_destroy(&scope, &to_remove, RemovalMode::Nullify)?;
			}
			for record in &to_add {
				if let Some(owner_id) = identity {
					record.set(reflection.foreign_key(), json!(owner_id));
				}
				tx.insert(record)?;
			}
			Ok(())
		});

		match outcome {
			Ok(()) => {
				self.install_target(owner, new_list);
				Ok(())
			}
			Err(err) => {
				tracing::debug!(association = reflection.name(), error = %err, "replace rolled back");
				let collection = self.collection_mut()?;
				collection.restore_target(original);
				Err(FormError::NotSaved {
					association: reflection.name().to_string(),
				})
			}
		}
	}

	/// Append records, inserting each through the store when the owner is
	/// persisted; for an unpersisted owner the append is in-memory only
	/// and persistence is deferred to the save cascade.
	pub fn concat(&mut self, owner: &Record, store: &dyn Store, records: Vec<Record>) -> FormResult<()> {
		for record in &records {
			self.type_mismatch_check(record)?;
		}
		if owner.is_new_record() {
			self.load_collection(owner, store, false)?;
			for record in records {
				self.add_to_target(owner, record, true);
			}
			return Ok(());
		}

		let reflection = self.reflection.clone();
		let owner_id = owner.identity();
		let insert_all = |tx: &dyn Store, records: &[Record]| -> FormResult<()> {
			for record in records {
				if let Some(id) = owner_id {
					record.set(reflection.foreign_key(), json!(id));
				}
				tx.insert(record)?;
			}
			Ok(())
		};

		// More than one mutating storage call gets a transactional scope.
		if records.len() > 1 {
			store.within_transaction(&mut |tx| insert_all(tx, &records))?;
		} else {
			insert_all(store, &records)?;
		}
		for record in records {
			self.add_to_target(owner, record, true);
		}
		Ok(())
	}

	/// Remove records from the association, delegating the storage-side
	/// removal of persisted members as one atomic batch. The records leave
	/// the in-memory target once the storage step succeeds.
	pub fn delete_or_destroy(
		&mut self,
		owner: &Record,
		store: &dyn Store,
		records: Vec<Record>,
		mode: RemovalMode,
	) -> FormResult<()> {
		if records.is_empty() {
			return Ok(());
		}
		for record in &records {
			self.type_mismatch_check(record)?;
		}

		let existing: Vec<Record> = records.iter().filter(|r| r.is_persisted()).cloned().collect();
		let scope = self.scope(owner);
		if !existing.is_empty() {
			store.within_transaction(&mut |tx| {
				tx.delete_or_destroy(&scope, &existing, mode).map_err(Into::into)
			})?;
		}

		let keys: IndexSet<_> = records.iter().map(Record::key).collect();
		self.collection_mut()?.remove_keys(&keys);
		Ok(())
	}

	/// Collection cardinality without forcing a full fetch: the loaded
	/// target's length when loaded, otherwise a delegated count plus the
	/// unsaved in-memory members.
	pub fn size(&self, owner: &Record, store: &dyn Store) -> FormResult<usize> {
		let collection = self.collection_ref()?;
		if collection.is_loaded() || owner.identity().is_none() {
			return Ok(collection.len());
		}
		let counted = store.count(&self.scope(owner))?;
		Ok(counted + collection.unsaved_len())
	}

	pub fn is_empty(&self, owner: &Record, store: &dyn Store) -> FormResult<bool> {
		let collection = self.collection_ref()?;
		if collection.is_loaded() || owner.identity().is_none() {
			return Ok(collection.len() == 0);
		}
		if collection.len() > 0 {
			return Ok(false);
		}
		Ok(store.count(&self.scope(owner))? == 0)
	}

	/// Drop and refetch the target.
	pub fn reload(&mut self, owner: &Record, store: &dyn Store) -> FormResult<()> {
		self.reset();
		match self.reflection.kind() {
			AssociationKind::HasOne => self.load_singular(owner, store).map(|_| ()),
			AssociationKind::HasMany => self.load_collection(owner, store, true),
		}
	}

	// --- internals -----------------------------------------------------

	/// Make `new_list` the target, wiring bookkeeping and inverses.
	fn install_target(&mut self, owner: &Record, new_list: Vec<Record>) {
		for record in &new_list {
			self.link_inverse(owner, record);
		}
		if let Strategy::Collection(collection) = &mut self.strategy {
			collection.take_target();
			for record in new_list {
				collection.replace_on_target(record, true);
			}
			collection.mark_loaded(owner.identity());
		}
	}

	fn kind_mismatch(&self, expected: AssociationKind) -> FormError {
		FormError::KindMismatch {
			name: self.reflection.name().to_string(),
			expected,
		}
	}

	fn singular_mut(&mut self) -> FormResult<&mut SingularAssociation> {
		match &mut self.strategy {
			Strategy::Singular(s) => Ok(s),
			Strategy::Collection(_) => Err(FormError::KindMismatch {
				name: self.reflection.name().to_string(),
				expected: AssociationKind::HasOne,
			}),
		}
	}

	fn collection_mut(&mut self) -> FormResult<&mut CollectionAssociation> {
		match &mut self.strategy {
			Strategy::Collection(c) => Ok(c),
			Strategy::Singular(_) => Err(FormError::KindMismatch {
				name: self.reflection.name().to_string(),
				expected: AssociationKind::HasMany,
			}),
		}
	}

	fn collection_ref(&self) -> FormResult<&CollectionAssociation> {
		match &self.strategy {
			Strategy::Collection(c) => Ok(c),
			Strategy::Singular(_) => Err(FormError::KindMismatch {
				name: self.reflection.name().to_string(),
				expected: AssociationKind::HasMany,
			}),
		}
	}
}

/// Fail with `TypeMismatch` unless `record` is an instance of the
/// reflection's class or a registered subtype of it.
fn check_record_type(reflection: &Reflection, record: &Record) -> FormResult<()> {
	let target_class = reflection.target_class()?;
	if target_class.accepts(&record.class()) {
		Ok(())
	} else {
		Err(FormError::TypeMismatch {
			expected: reflection.class_name().to_string(),
			got: record.class().name().to_string(),
		})
	}
}

/// Point the declared inverse association on `record` back at `owner`
/// without a storage round-trip.
///
/// The link is non-owning: the inverse slot holds a weak handle, never a
/// strong cycle. Links are skipped silently when the target class declares
/// no matching singular association.
pub(crate) fn link_inverse(reflection: &Reflection, owner: &Record, record: &Record) {
	let Some(inverse_name) = reflection.options().inverse_of.as_deref() else {
		return;
	};
	// A record cannot back-reference itself through the association being
	// written; that would be the same lock.
	if record.same_record(owner) && inverse_name == reflection.name() {
		return;
	}
	let Some(inverse_reflection) = record.class().reflect_on(inverse_name) else {
		tracing::warn!(
			inverse = inverse_name,
			class = record.class().name(),
			"inverse association is not declared; link skipped"
		);
		return;
	};
	if inverse_reflection.is_collection() {
		return;
	}
	let Ok(inverse) = record.association(inverse_name) else {
		return;
	};
	inverse.write().set_back_reference(record.identity(), owner);
}
