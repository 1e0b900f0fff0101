//! The storage collaborator.
//!
//! The association machinery never issues storage operations of its own:
//! fetching, counting, persisting, and transactional scoping are delegated
//! through the [`Store`] trait, passed into each operation the way a
//! connection handle is. [`MemoryStore`] is the in-process reference
//! implementation used by the test suites; it assigns ids, counts calls,
//! and can inject insert failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::error::{FormResult, RecordId, StoreError};
use crate::record::Record;
use crate::registry::{self, ClassDescriptor};
use crate::value::{AttributeMap, id_of};

/// How records leave a collection on the storage side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
	/// Remove the rows and run their teardown.
	Destroy,
	/// Remove the rows directly.
	Delete,
	/// Keep the rows but clear their foreign key.
	Nullify,
}

/// Query surface for one association's related records: rows of
/// `class_name` whose `foreign_key` attribute holds `owner_id`.
///
/// An absent `owner_id` is a null scope: it matches nothing, which is what
/// an unpersisted owner's associations query as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationScope {
	pub class_name: String,
	pub foreign_key: String,
	pub owner_id: Option<RecordId>,
}

impl AssociationScope {
	pub fn new(
		class_name: impl Into<String>,
		foreign_key: impl Into<String>,
		owner_id: Option<RecordId>,
	) -> Self {
		Self {
			class_name: class_name.into(),
			foreign_key: foreign_key.into(),
			owner_id,
		}
	}

	/// Fetch the scope's records restricted to `ids`, normalizing the
	/// store's "nothing found" signal to an empty list.
	pub fn find_existing(&self, store: &dyn Store, ids: &[RecordId]) -> FormResult<Vec<Record>> {
		match store.find(self, Some(ids)) {
			Ok(records) => Ok(records),
			Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
			Err(err) => Err(err.into()),
		}
	}
}

/// External persistence collaborator consumed by the association
/// machinery.
pub trait Store {
	/// Construction protocol: a fresh unpersisted record of `class` with
	/// `attributes` assigned.
	fn build(&self, class: &Arc<ClassDescriptor>, attributes: &AttributeMap) -> Record {
		let record = Record::new(class.clone());
		record.assign_attributes(attributes);
		record
	}

	/// Records matching the scope, optionally restricted to `ids`, in
	/// storage order.
	fn find(&self, scope: &AssociationScope, ids: Option<&[RecordId]>) -> Result<Vec<Record>, StoreError>;

	/// Cardinality of the scope without materializing records.
	fn count(&self, scope: &AssociationScope) -> Result<usize, StoreError>;

	/// Persist a new record, assigning its identity.
	fn insert(&self, record: &Record) -> Result<(), StoreError>;

	/// Persist changes to an existing record.
	fn update(&self, record: &Record) -> Result<(), StoreError>;

	/// Remove (or unlink, for [`RemovalMode::Nullify`]) the given records.
	fn delete_or_destroy(
		&self,
		scope: &AssociationScope,
		records: &[Record],
		mode: RemovalMode,
	) -> Result<(), StoreError>;

	/// Run `f` inside one atomic batch: either every mutation in the
	/// closure lands, or none does.
	fn within_transaction(&self, f: &mut dyn FnMut(&dyn Store) -> FormResult<()>) -> FormResult<()>;
}

/// Snapshot of how often each store operation ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
	pub finds: usize,
	pub counts: usize,
	pub inserts: usize,
	pub updates: usize,
	pub deletes: usize,
	pub transactions: usize,
}

#[derive(Default)]
struct CallCounters {
	finds: AtomicUsize,
	counts: AtomicUsize,
	inserts: AtomicUsize,
	updates: AtomicUsize,
	deletes: AtomicUsize,
	transactions: AtomicUsize,
}

type Tables = IndexMap<String, IndexMap<RecordId, AttributeMap>>;

/// In-process [`Store`] backed by per-class row maps.
///
/// # Examples
///
/// ```
/// use active_form::store::MemoryStore;
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// let id = store.seed("CustomerForm", [("name".to_string(), json!("bob"))].into_iter().collect());
/// assert!(id > 0);
/// ```
pub struct MemoryStore {
	tables: RwLock<Tables>,
	next_id: AtomicI64,
	calls: CallCounters,
	fail_inserts: AtomicBool,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self {
			tables: RwLock::new(IndexMap::new()),
			next_id: AtomicI64::new(1),
			calls: CallCounters::default(),
			fail_inserts: AtomicBool::new(false),
		}
	}

	/// Write a row directly, bypassing the call counters. Returns the
	/// row's id, assigning the next free one when the attributes carry
	/// none.
	pub fn seed(&self, class_name: &str, mut attributes: AttributeMap) -> RecordId {
		let id = attributes
			.get("id")
			.and_then(id_of)
			.unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
		attributes.insert("id".to_string(), json!(id));
		self.tables
			.write()
			.entry(class_name.to_string())
			.or_default()
			.insert(id, attributes);
		id
	}

	/// Make every subsequent insert fail, for exercising rollback paths.
	pub fn fail_inserts(&self, enabled: bool) {
		self.fail_inserts.store(enabled, Ordering::Relaxed);
	}

	/// Call counts so far.
	pub fn calls(&self) -> StoreCalls {
		StoreCalls {
			finds: self.calls.finds.load(Ordering::Relaxed),
			counts: self.calls.counts.load(Ordering::Relaxed),
			inserts: self.calls.inserts.load(Ordering::Relaxed),
			updates: self.calls.updates.load(Ordering::Relaxed),
			deletes: self.calls.deletes.load(Ordering::Relaxed),
			transactions: self.calls.transactions.load(Ordering::Relaxed),
		}
	}

	/// Current row attributes, for test assertions.
	pub fn row(&self, class_name: &str, id: RecordId) -> Option<AttributeMap> {
		self.tables.read().get(class_name).and_then(|rows| rows.get(&id)).cloned()
	}

	fn matching_rows(&self, scope: &AssociationScope, ids: Option<&[RecordId]>) -> Vec<(RecordId, AttributeMap)> {
		let Some(owner_id) = scope.owner_id else {
			return Vec::new();
		};
		let tables = self.tables.read();
		let Some(rows) = tables.get(&scope.class_name) else {
			return Vec::new();
		};
		rows.iter()
			.filter(|(id, attributes)| {
				let linked = attributes
					.get(&scope.foreign_key)
					.and_then(id_of)
					.is_some_and(|fk| fk == owner_id);
				let selected = ids.is_none_or(|ids| ids.contains(id));
				linked && selected
			})
			.map(|(id, attributes)| (*id, attributes.clone()))
			.collect()
	}

	fn materialize(&self, scope: &AssociationScope, attributes: AttributeMap) -> Result<Record, StoreError> {
		let class = registry::lookup(&scope.class_name).ok_or_else(|| {
			StoreError::Backend(format!("class `{}` is not registered", scope.class_name))
		})?;
		let record = Record::new(class);
		for (name, value) in attributes {
			record.refresh(&name, value);
		}
		Ok(record)
	}
}

impl Store for MemoryStore {
	fn find(&self, scope: &AssociationScope, ids: Option<&[RecordId]>) -> Result<Vec<Record>, StoreError> {
		self.calls.finds.fetch_add(1, Ordering::Relaxed);
		self.matching_rows(scope, ids)
			.into_iter()
			.map(|(_, attributes)| self.materialize(scope, attributes))
			.collect()
	}

	fn count(&self, scope: &AssociationScope) -> Result<usize, StoreError> {
		self.calls.counts.fetch_add(1, Ordering::Relaxed);
		Ok(self.matching_rows(scope, None).len())
	}

	fn insert(&self, record: &Record) -> Result<(), StoreError> {
		self.calls.inserts.fetch_add(1, Ordering::Relaxed);
		if self.fail_inserts.load(Ordering::Relaxed) {
			return Err(StoreError::Backend("insert refused".to_string()));
		}
		let id = record
			.identity()
			.unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
		record.refresh("id", json!(id));
		self.tables
			.write()
			.entry(record.class().name().to_string())
			.or_default()
			.insert(id, record.attributes());
		record.clear_changes();
		Ok(())
	}

	fn update(&self, record: &Record) -> Result<(), StoreError> {
		self.calls.updates.fetch_add(1, Ordering::Relaxed);
		let id = record.identity().ok_or_else(|| {
			StoreError::Backend("cannot update a record without an identity".to_string())
		})?;
		self.tables
			.write()
			.entry(record.class().name().to_string())
			.or_default()
			.insert(id, record.attributes());
		record.clear_changes();
		Ok(())
	}

	fn delete_or_destroy(
		&self,
		scope: &AssociationScope,
		records: &[Record],
		mode: RemovalMode,
	) -> Result<(), StoreError> {
		self.calls.deletes.fetch_add(1, Ordering::Relaxed);
		let mut tables = self.tables.write();
		let rows = tables.entry(scope.class_name.clone()).or_default();
		for record in records {
			let Some(id) = record.identity() else { continue };
			match mode {
				RemovalMode::Destroy | RemovalMode::Delete => {
					rows.shift_remove(&id);
				}
				RemovalMode::Nullify => {
					if let Some(row) = rows.get_mut(&id) {
						row.insert(scope.foreign_key.clone(), Value::Null);
					}
				}
			}
		}
		Ok(())
	}

	fn within_transaction(&self, f: &mut dyn FnMut(&dyn Store) -> FormResult<()>) -> FormResult<()> {
		self.calls.transactions.fetch_add(1, Ordering::Relaxed);
		let snapshot = self.tables.read().clone();
		let result = f(self);
		if result.is_err() {
			*self.tables.write() = snapshot;
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::ClassBuilder;

	fn setup() -> MemoryStore {
		ClassBuilder::new("StoreTestItemForm")
			.attribute("name")
			.attribute("order_id")
			.register()
			.unwrap();
		MemoryStore::new()
	}

	fn item_scope(owner_id: Option<RecordId>) -> AssociationScope {
		AssociationScope::new("StoreTestItemForm", "order_id", owner_id)
	}

	#[test]
	fn test_find_filters_by_foreign_key_and_ids() {
		let store = setup();
		let a = store.seed(
			"StoreTestItemForm",
			[("name".to_string(), json!("a")), ("order_id".to_string(), json!(1))]
				.into_iter()
				.collect(),
		);
		store.seed(
			"StoreTestItemForm",
			[("name".to_string(), json!("b")), ("order_id".to_string(), json!(2))]
				.into_iter()
				.collect(),
		);

		let records = store.find(&item_scope(Some(1)), None).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].identity(), Some(a));
		// Loaded records start without pending changes.
		assert!(!records[0].is_changed());

		let records = store.find(&item_scope(Some(1)), Some(&[999])).unwrap();
		assert!(records.is_empty());
	}

	#[test]
	fn test_null_scope_matches_nothing() {
		let store = setup();
		store.seed(
			"StoreTestItemForm",
			[("order_id".to_string(), json!(1))].into_iter().collect(),
		);
		assert!(store.find(&item_scope(None), None).unwrap().is_empty());
		assert_eq!(store.count(&item_scope(None)).unwrap(), 0);
	}

	#[test]
	fn test_insert_assigns_identity_and_clears_changes() {
		let store = setup();
		let class = registry::lookup("StoreTestItemForm").unwrap();
		let record = Record::new(class);
		record.set("name", json!("fresh"));
		store.insert(&record).unwrap();
		assert!(record.is_persisted());
		assert!(!record.is_changed());
		assert_eq!(store.calls().inserts, 1);
	}

	#[test]
	fn test_transaction_rolls_back_on_error() {
		let store = setup();
		let class = registry::lookup("StoreTestItemForm").unwrap();
		let record = Record::new(class);
		record.set("name", json!("doomed"));

		let result = store.within_transaction(&mut |tx| {
			tx.insert(&record)?;
			Err(crate::error::FormError::NotSaved {
				association: "items".to_string(),
			})
		});
		assert!(result.is_err());
		assert!(store.row("StoreTestItemForm", record.identity().unwrap()).is_none());
	}

	#[test]
	fn test_nullify_keeps_rows() {
		let store = setup();
		let id = store.seed(
			"StoreTestItemForm",
			[("order_id".to_string(), json!(1))].into_iter().collect(),
		);
		let records = store.find(&item_scope(Some(1)), None).unwrap();
		store
			.delete_or_destroy(&item_scope(Some(1)), &records, RemovalMode::Nullify)
			.unwrap();
		let row = store.row("StoreTestItemForm", id).unwrap();
		assert_eq!(row.get("order_id"), Some(&Value::Null));
	}
}
