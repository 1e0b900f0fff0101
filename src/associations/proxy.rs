//! Live collection view returned by the owner's association reader.

use crate::error::{FormResult, RecordId};
use crate::record::Record;
use crate::store::{RemovalMode, Store};
use crate::value::AttributeMap;

use super::association::SharedAssociation;

/// The object a collection reader hands out.
///
/// The proxy presents a plain sequence interface while forwarding every
/// operation to the underlying collection association. It is a live view,
/// not a detached copy, so mutations through the proxy mutate the
/// association's target.
///
/// # Examples
///
/// ```no_run
/// # use active_form::prelude::*;
/// # fn demo(order: Record, store: &dyn Store) -> FormResult<()> {
/// let barcodes = order.collection("barcodes")?;
/// let barcode = barcodes.build(
///     store,
///     [("code".to_string(), serde_json::json!("123"))].into_iter().collect(),
/// )?;
/// assert!(barcode.is_new_record());
/// assert_eq!(barcodes.records(store)?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct CollectionProxy {
	owner: Record,
	name: String,
}

impl CollectionProxy {
	pub(crate) fn new(owner: Record, name: String) -> Self {
		Self { owner, name }
	}

	/// Name of the association this proxy fronts.
	pub fn name(&self) -> &str {
		&self.name
	}

	fn association(&self) -> FormResult<SharedAssociation> {
		self.owner.association(&self.name)
	}

	/// The target records, loading (and merging) first when the
	/// association is unloaded or stale.
	pub fn records(&self, store: &dyn Store) -> FormResult<Vec<Record>> {
		self.load(store, false)
	}

	/// Like [`records`](Self::records), but with `force` set the fetch
	/// happens even when the association is loaded and fresh; in-memory
	/// records are merged with the fetched rows, not discarded.
	pub fn load(&self, store: &dyn Store, force: bool) -> FormResult<Vec<Record>> {
		let association = self.association()?;
		association.write().load_collection(&self.owner, store, force)?;
		Ok(association.read().target_records())
	}

	/// Cardinality without forcing a full fetch.
	pub fn len(&self, store: &dyn Store) -> FormResult<usize> {
		Ok(self.association()?.read().size(&self.owner, store)?)
	}

	pub fn is_empty(&self, store: &dyn Store) -> FormResult<bool> {
		Ok(self.association()?.read().is_empty(&self.owner, store)?)
	}

	/// Whether the underlying association has loaded its target.
	pub fn is_loaded(&self) -> FormResult<bool> {
		Ok(self.association()?.read().is_loaded())
	}

	/// Current in-memory member at `index`, without loading.
	pub fn get(&self, index: usize) -> FormResult<Option<Record>> {
		Ok(self.association()?.read().target_records().get(index).cloned())
	}

	/// Build one unpersisted record into the target.
	pub fn build(&self, store: &dyn Store, attributes: AttributeMap) -> FormResult<Record> {
		self.association()?
			.write()
			.build_collection(&self.owner, store, &attributes)
	}

	/// Build several unpersisted records into the target, in order.
	pub fn build_many(
		&self,
		store: &dyn Store,
		attributes: Vec<AttributeMap>,
	) -> FormResult<Vec<Record>> {
		let association = self.association()?;
		let mut records = Vec::with_capacity(attributes.len());
		for attrs in &attributes {
			records.push(association.write().build_collection(&self.owner, store, attrs)?);
		}
		Ok(records)
	}

	/// Append one record; inserts through the store when the owner is
	/// persisted.
	pub fn push(&self, store: &dyn Store, record: Record) -> FormResult<()> {
		self.concat(store, vec![record])
	}

	/// Append records; inserts through the store when the owner is
	/// persisted.
	pub fn concat(&self, store: &dyn Store, records: Vec<Record>) -> FormResult<()> {
		self.association()?.write().concat(&self.owner, store, records)
	}

	/// Replace the whole target, diffing by identity.
	pub fn replace(&self, store: &dyn Store, records: Vec<Record>) -> FormResult<()> {
		self.association()?.write().replace(&self.owner, store, records)
	}

	/// Remove the given records, delegating persisted removals to the
	/// store.
	pub fn delete(&self, store: &dyn Store, records: Vec<Record>, mode: RemovalMode) -> FormResult<()> {
		self.association()?
			.write()
			.delete_or_destroy(&self.owner, store, records, mode)
	}

	/// Remove every current member.
	pub fn clear(&self, store: &dyn Store, mode: RemovalMode) -> FormResult<()> {
		let association = self.association()?;
		association.write().load_collection(&self.owner, store, false)?;
		let records = association.read().target_records();
		association
			.write()
			.delete_or_destroy(&self.owner, store, records, mode)
	}

	/// Member with the given persisted identity, loading first.
	pub fn find_by_id(&self, store: &dyn Store, id: RecordId) -> FormResult<Option<Record>> {
		let records = self.records(store)?;
		Ok(records.into_iter().find(|record| record.identity() == Some(id)))
	}

	/// Drop and refetch the target.
	pub fn reload(&self, store: &dyn Store) -> FormResult<()> {
		self.association()?.write().reload(&self.owner, store)
	}
}
