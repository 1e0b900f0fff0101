//! Error types for the association and nested-attribute machinery.
//!
//! Structural contract violations (wrong record type, unresolvable ids,
//! payload limits) surface as [`FormError`] values and abort the operation
//! that raised them. Validation failures are *not* errors: they accumulate
//! on the owning record's error collection and are inspected through
//! `Record::errors`.

use crate::reflection::AssociationKind;

/// Identity of a persisted record.
pub type RecordId = i64;

/// Errors raised by the storage collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
	/// The store could not locate any record for the given scope.
	///
	/// Singular association loads treat this as "no target" and reset the
	/// association instead of propagating.
	#[error("no {class_name} record found")]
	NotFound { class_name: String },
	/// Any other backend failure.
	#[error("storage backend error: {0}")]
	Backend(String),
}

/// Errors raised by association and nested-attribute operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FormError {
	/// A record of the wrong class was assigned to an association.
	#[error("{expected} expected, got an instance of {got}")]
	TypeMismatch { expected: String, got: String },

	/// A nested payload supplied an `id` that does not resolve against the
	/// association's current or persisted records.
	#[error("couldn't find {class_name} with id={id} for {owner}")]
	NestedRecordNotFound {
		class_name: String,
		owner: String,
		id: String,
	},

	/// A nested collection payload exceeded the configured limit.
	#[error("maximum {limit} records are allowed, got {got}")]
	TooManyRecords { limit: usize, got: usize },

	/// A collection replace could not persist its additions. The in-memory
	/// target has been rolled back to its pre-operation snapshot.
	#[error("failed to replace {association}: one or more records could not be saved")]
	NotSaved { association: String },

	/// A variant tag did not resolve against the base class's registered
	/// subtypes.
	#[error("unknown variant `{tag}` for {base}")]
	UnknownVariant { tag: String, base: String },

	/// A class name did not resolve against the process-wide registry.
	#[error("no registered class named `{0}`")]
	UnknownClass(String),

	/// The named association has not been declared on the owning class.
	#[error("no association named `{0}`")]
	UnknownAssociation(String),

	/// A singular operation was invoked on a collection association or
	/// vice versa.
	#[error("association `{name}` is not {expected}")]
	KindMismatch {
		name: String,
		expected: AssociationKind,
	},

	/// A nested payload had an unusable shape (neither map nor list where
	/// one was required).
	#[error("invalid payload for `{association}`: {detail}")]
	InvalidPayload {
		association: String,
		detail: String,
	},

	/// A storage operation failed.
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Result alias used throughout the crate.
pub type FormResult<T> = Result<T, FormError>;
