//! Cascade validation: child failures projected onto the owner with
//! association-scoped attribute paths, deduplication, destroy-marked
//! skipping, and cycle safety through inverse links.

use active_form::nested_attributes::NestedAttributesAssigner;
use active_form::prelude::*;
use active_form::registry;
use serde_json::json;

use rstest::*;

fn declare_classes() {
	let _ = ClassBuilder::new("BarcodeForm")
		.attribute("code")
		.attribute("order_id")
		.validates_required("code")
		.association(Reflection::new(
			"order",
			AssociationKind::HasOne,
			"OrderForm",
			"order_id",
		))
		.register()
		.unwrap();
	let _ = ClassBuilder::new("OrderForm")
		.attribute("reference")
		.association(
			Reflection::new("barcodes", AssociationKind::HasMany, "BarcodeForm", "order_id")
				.inverse_of("order"),
		)
		.accepts_nested_attributes_for(
			"barcodes",
			NestedAttributesOptions::new().allow_destroy(true),
		)
		.register()
		.unwrap();
	let _ = ClassBuilder::new("IndexedOrderForm")
		.attribute("reference")
		.association(
			Reflection::new("barcodes", AssociationKind::HasMany, "BarcodeForm", "order_id")
				.index_errors(true),
		)
		.register()
		.unwrap();
	let _ = ClassBuilder::new("CustomerForm")
		.attribute("name")
		.attribute("ticket_id")
		.validates_required("name")
		.register()
		.unwrap();
	let _ = ClassBuilder::new("TicketForm")
		.attribute("subject")
		.association(Reflection::new(
			"customer",
			AssociationKind::HasOne,
			"CustomerForm",
			"ticket_id",
		))
		.register()
		.unwrap();
}

#[fixture]
fn store() -> MemoryStore {
	declare_classes();
	MemoryStore::new()
}

fn build(class: &str) -> Record {
	Record::new(registry::lookup(class).unwrap())
}

// =============================================================================
// Collection cascade
// =============================================================================

#[rstest]
fn test_invalid_child_makes_the_owner_invalid(store: MemoryStore) {
	let order = build("OrderForm");
	let barcodes = order.collection("barcodes").unwrap();
	barcodes.build(&store, Default::default()).unwrap();

	assert!(!order.validate(&store));
	assert_eq!(order.errors().on("barcodes.code"), vec!["can't be blank"]);
}

#[rstest]
fn test_valid_children_leave_the_owner_valid(store: MemoryStore) {
	let order = build("OrderForm");
	let barcodes = order.collection("barcodes").unwrap();
	barcodes
		.build(&store, [("code".to_string(), json!("123"))].into_iter().collect())
		.unwrap();

	assert!(order.validate(&store));
	assert!(order.errors().is_empty());
}

#[rstest]
fn test_duplicate_child_errors_collapse(store: MemoryStore) {
	let order = build("OrderForm");
	let barcodes = order.collection("barcodes").unwrap();
	barcodes.build(&store, Default::default()).unwrap();
	barcodes.build(&store, Default::default()).unwrap();

	assert!(!order.validate(&store));
	// Two children fail identically; the owner reports the pair once.
	assert_eq!(order.errors().on("barcodes.code"), vec!["can't be blank"]);
	assert_eq!(order.errors().len(), 1);
}

#[rstest]
fn test_indexed_paths_reflect_validation_time_position(store: MemoryStore) {
	let order = build("IndexedOrderForm");
	let barcodes = order.collection("barcodes").unwrap();
	barcodes
		.build(&store, [("code".to_string(), json!("ok"))].into_iter().collect())
		.unwrap();
	barcodes.build(&store, Default::default()).unwrap();

	assert!(!order.validate(&store));
	assert_eq!(order.errors().on("barcodes[1].code"), vec!["can't be blank"]);
	assert!(order.errors().on("barcodes[0].code").is_empty());
}

#[rstest]
fn test_destroy_marked_children_are_skipped(store: MemoryStore) {
	let order = build("OrderForm");
	order.set("id", json!(1));
	store.seed(
		"BarcodeForm",
		[
			("id".to_string(), json!(2)),
			("code".to_string(), json!("")),
			("order_id".to_string(), json!(1)),
		]
		.into_iter()
		.collect(),
	);
	let barcodes = order.collection("barcodes").unwrap();
	barcodes.records(&store).unwrap();

	// Invalid while present, valid once flagged for destruction.
	assert!(!order.validate(&store));

	NestedAttributesAssigner::new(&store)
		.assign(&order, "barcodes", &json!([{"id": "2", "_destroy": "1"}]))
		.unwrap();
	assert!(order.validate(&store));
}

#[rstest]
fn test_untouched_associations_are_not_instantiated_by_validation(store: MemoryStore) {
	let order = build("OrderForm");
	order.set("id", json!(1));
	store.seed(
		"BarcodeForm",
		[
			("code".to_string(), json!("")),
			("order_id".to_string(), json!(1)),
		]
		.into_iter()
		.collect(),
	);

	// The association was never read or written, so validation does not
	// reach into storage for it.
	assert!(order.validate(&store));
	assert_eq!(store.calls().finds, 0);
}

// =============================================================================
// Singular cascade
// =============================================================================

#[rstest]
fn test_singular_child_errors_use_the_association_path(store: MemoryStore) {
	let ticket = build("TicketForm");
	ticket
		.build_related(&store, "customer", Default::default())
		.unwrap();

	assert!(!ticket.validate(&store));
	assert_eq!(ticket.errors().on("customer.name"), vec!["can't be blank"]);
}

#[rstest]
fn test_validation_passes_again_after_the_child_is_fixed(store: MemoryStore) {
	let ticket = build("TicketForm");
	let customer = ticket
		.build_related(&store, "customer", Default::default())
		.unwrap();

	assert!(!ticket.validate(&store));
	customer.set("name", json!("bob"));
	assert!(ticket.validate(&store));
	assert!(ticket.errors().is_empty());
}

// =============================================================================
// Cycles
// =============================================================================

#[rstest]
fn test_inverse_links_do_not_loop_validation(store: MemoryStore) {
	let order = build("OrderForm");
	let barcodes = order.collection("barcodes").unwrap();
	barcodes.build(&store, Default::default()).unwrap();

	// The child's `order` association points back at the owner; the
	// cascade must terminate and still report the child's failure.
	assert!(!order.validate(&store));
	assert_eq!(order.errors().on("barcodes.code"), vec!["can't be blank"]);
}
