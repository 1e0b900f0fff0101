//! Singular association state.

use crate::error::RecordId;
use crate::record::{Record, WeakRecord};

/// Target slot of a singular association.
///
/// `BackRef` is the non-owning arm used when the slot was populated by
/// inverse linking: the owner on the other side already holds this record,
/// so holding it strongly here would create a reference cycle.
#[derive(Debug, Clone, Default)]
pub enum SingularTarget {
	#[default]
	Unset,
	Record(Record),
	BackRef(WeakRecord),
}

impl SingularTarget {
	pub fn resolve(&self) -> Option<Record> {
		match self {
			SingularTarget::Unset => None,
			SingularTarget::Record(record) => Some(record.clone()),
			SingularTarget::BackRef(weak) => weak.upgrade(),
		}
	}
}

/// Per-owner state of a one-to-one association.
#[derive(Debug, Default)]
pub struct SingularAssociation {
	target: SingularTarget,
	loaded: bool,
	stale_key: Option<Option<RecordId>>,
}

impl SingularAssociation {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded
	}

	pub fn target(&self) -> Option<Record> {
		self.target.resolve()
	}

	/// Drop the target and all load bookkeeping. Idempotent.
	pub fn reset(&mut self) {
		self.target = SingularTarget::Unset;
		self.loaded = false;
		self.stale_key = None;
	}

	/// The association is stale when it was loaded under a different owner
	/// identity than the owner currently has.
	pub fn is_stale(&self, owner_identity: Option<RecordId>) -> bool {
		self.loaded && self.stale_key.is_some_and(|captured| captured != owner_identity)
	}

	/// Install a target and mark the association loaded under the owner's
	/// current identity.
	pub fn set_target(&mut self, target: Option<Record>, owner_identity: Option<RecordId>) {
		self.target = match target {
			Some(record) => SingularTarget::Record(record),
			None => SingularTarget::Unset,
		};
		self.mark_loaded(owner_identity);
	}

	/// Install a non-owning back-reference produced by inverse linking.
	pub fn set_back_reference(&mut self, owner: WeakRecord, owner_identity: Option<RecordId>) {
		self.target = SingularTarget::BackRef(owner);
		self.mark_loaded(owner_identity);
	}

	/// Mark the association loaded without touching the target slot; a
	/// back-reference target must stay non-owning.
	pub fn mark_loaded(&mut self, owner_identity: Option<RecordId>) {
		self.loaded = true;
		self.stale_key = Some(owner_identity);
	}
}
