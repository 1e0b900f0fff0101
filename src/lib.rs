//! Form objects with ORM-style associations over non-persisted records
//!
//! This crate lets an owning form record lazily reference, load, replace,
//! and cascade-validate related records without issuing storage operations
//! of its own: persistence is delegated to a [`store::Store`] collaborator
//! passed into each operation. It provides:
//! - Association declaration through registered class descriptors, with
//!   immutable per-association [`reflection::Reflection`] metadata
//! - Lazily loaded singular and collection associations with staleness
//!   tracking and an identity-preserving list-merge algorithm
//! - Nested-attribute assignment: payload maps and lists translated into
//!   build/update/destroy-mark operations with limits, rejection rules,
//!   and destroy flags
//! - Cascade validation with child errors projected onto the owner under
//!   association-scoped attribute paths
//! - Parameter intake with closed variant-tag resolution
//!
//! # Examples
//!
//! ```
//! use active_form::prelude::*;
//! use serde_json::json;
//!
//! let _ = ClassBuilder::new("BarcodeForm")
//!     .attribute("code")
//!     .attribute("order_id")
//!     .validates_required("code")
//!     .register()
//!     .unwrap();
//! let order_class = ClassBuilder::new("OrderForm")
//!     .attribute("reference")
//!     .has_many("barcodes", "BarcodeForm")
//!     .accepts_nested_attributes_for("barcodes", NestedAttributesOptions::new())
//!     .register()
//!     .unwrap();
//!
//! let store = MemoryStore::new();
//! let order = from_params(
//!     &store,
//!     &order_class,
//!     serde_json::json!({
//!         "reference": "A-1",
//!         "barcodes_attributes": [{"code": "123"}, {"code": ""}],
//!     })
//!     .as_object()
//!     .unwrap(),
//! )
//! .unwrap();
//!
//! assert!(!order.validate(&store));
//! assert_eq!(order.errors().on("barcodes.code"), vec!["can't be blank"]);
//! ```

pub mod associations;
pub mod error;
pub mod nested_attributes;
pub mod params;
pub mod record;
pub mod reflection;
pub mod registry;
pub mod store;
pub mod validation;
pub mod value;

pub use associations::{CollectionProxy, merge_target_lists};
pub use error::{FormError, FormResult, RecordId, StoreError};
pub use nested_attributes::{
	LimitRule, NestedAttributesAssigner, NestedAttributesOptions, RejectRule,
};
pub use params::from_params;
pub use record::{Record, RecordKey, WeakRecord};
pub use reflection::{AssociationKind, Reflection, ReflectionOptions};
pub use registry::{ClassBuilder, ClassDescriptor};
pub use store::{AssociationScope, MemoryStore, RemovalMode, Store, StoreCalls};
pub use validation::{ErrorEntry, ErrorProjector, Errors, Validator};

/// Everything a typical caller needs in scope.
pub mod prelude {
	pub use crate::associations::CollectionProxy;
	pub use crate::error::{FormError, FormResult, RecordId};
	pub use crate::nested_attributes::{LimitRule, NestedAttributesOptions, RejectRule};
	pub use crate::params::from_params;
	pub use crate::record::{Record, RecordKey};
	pub use crate::reflection::{AssociationKind, Reflection};
	pub use crate::registry::ClassBuilder;
	pub use crate::store::{MemoryStore, RemovalMode, Store};
	pub use crate::validation::Errors;
}
