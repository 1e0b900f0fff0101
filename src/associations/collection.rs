//! Collection association state and the list-merge algorithm.

use indexmap::IndexSet;

use crate::error::RecordId;
use crate::record::{Record, RecordKey};

/// Per-owner state of a one-to-many association.
///
/// `target` is an ordered sequence without duplicate identities.
/// `pending_additions` tracks surrogate keys of records that were pushed
/// or spliced into the target since the last reset; replace semantics use
/// it to decide whether an incoming record overwrites its existing slot
/// instead of being appended again.
#[derive(Debug, Default)]
pub struct CollectionAssociation {
	target: Vec<Record>,
	loaded: bool,
	stale_key: Option<Option<RecordId>>,
	pending_additions: IndexSet<RecordKey>,
}

impl CollectionAssociation {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded
	}

	pub fn is_stale(&self, owner_identity: Option<RecordId>) -> bool {
		self.loaded && self.stale_key.is_some_and(|captured| captured != owner_identity)
	}

	pub fn records(&self) -> Vec<Record> {
		self.target.clone()
	}

	pub fn len(&self) -> usize {
		self.target.len()
	}

	pub fn get(&self, index: usize) -> Option<Record> {
		self.target.get(index).cloned()
	}

	/// Record in the target whose persisted identity matches `id` in its
	/// canonical string form.
	pub fn find_by_id_string(&self, id: &str) -> Option<Record> {
		self.target
			.iter()
			.find(|record| {
				record
					.identity()
					.map(|identity| identity.to_string())
					.as_deref() == Some(id)
			})
			.cloned()
	}

	pub fn contains_key(&self, key: &RecordKey) -> bool {
		self.target.iter().any(|record| record.key() == *key)
	}

	/// Count of target members that are not yet persisted.
	pub fn unsaved_len(&self) -> usize {
		self.target.iter().filter(|record| record.is_new_record()).count()
	}

	pub fn reset(&mut self) {
		self.target.clear();
		self.loaded = false;
		self.stale_key = None;
		self.pending_additions.clear();
	}

	pub fn mark_loaded(&mut self, owner_identity: Option<RecordId>) {
		self.loaded = true;
		self.stale_key = Some(owner_identity);
	}

	/// Swap in a freshly merged target.
	pub fn set_merged_target(&mut self, target: Vec<Record>, owner_identity: Option<RecordId>) {
		self.target = target;
		self.mark_loaded(owner_identity);
	}

	pub fn take_target(&mut self) -> Vec<Record> {
		std::mem::take(&mut self.target)
	}

	pub fn restore_target(&mut self, target: Vec<Record>) {
		self.target = target;
	}

	/// Insert-or-replace by surrogate key.
	///
	/// With `replace` set, an incoming record whose key is already present
	/// (or that is persisted) overwrites its existing slot, so the same
	/// logical record never appears twice. Records not present yet are
	/// appended.
	pub fn replace_on_target(&mut self, record: Record, replace: bool) -> Record {
		let key = record.key();
		let index = if replace && (!record.is_new_record() || self.pending_additions.contains(&key)) {
			self.target.iter().position(|existing| existing.key() == key)
		} else {
			None
		};

		if index.is_some() || record.is_new_record() {
			self.pending_additions.insert(key);
		}

		match index {
			Some(i) => self.target[i] = record.clone(),
			None => self.target.push(record.clone()),
		}
		record
	}

	/// Remove every record whose key appears in `keys`.
	pub fn remove_keys(&mut self, keys: &IndexSet<RecordKey>) {
		self.target.retain(|record| !keys.contains(&record.key()));
		for key in keys {
			self.pending_additions.shift_remove(key);
		}
	}
}

/// Reconcile a freshly fetched record list with the in-memory target.
///
/// Rules:
/// - the final list has no duplicate identities;
/// - the persisted list's order is the backbone of the result;
/// - a memory record with a matching identity replaces its persisted twin,
///   keeping every attribute it has unsaved changes for and refreshing the
///   rest from the persisted copy;
/// - unsaved memory records trail the result in their original order;
/// - persisted memory records with no match upstream are dropped.
pub fn merge_target_lists(persisted: Vec<Record>, memory: Vec<Record>) -> Vec<Record> {
	if memory.is_empty() {
		return persisted;
	}

	let mut memory = memory;
	let mut merged = Vec::with_capacity(persisted.len() + memory.len());

	for record in persisted {
		let key = record.key();
		match memory.iter().position(|candidate| candidate.key() == key) {
			Some(index) => {
				let kept = memory.remove(index);
				let changed = kept.changed_attribute_names();
				for name in record.attribute_names() {
					if kept.has_attribute(&name) && !changed.contains(&name) {
						if let Some(value) = record.get(&name) {
							kept.refresh(&name, value);
						}
					}
				}
				tracing::trace!(key = ?key, "kept in-memory record over persisted copy");
				merged.push(kept);
			}
			None => merged.push(record),
		}
	}

	merged.extend(memory.into_iter().filter(Record::is_new_record));
	merged
}

/// Surrogate-key sequence of a record list, the comparison basis for the
/// replace no-op fast path.
pub fn identity_sequence(records: &[Record]) -> Vec<RecordKey> {
	records.iter().map(Record::key).collect()
}
