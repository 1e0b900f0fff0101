//! Collection association lifecycle tests: building, concat, the
//! list-merge algorithm, replace diffing with rollback, batched removal,
//! and count delegation.

use active_form::AssociationScope;
use active_form::prelude::*;
use active_form::registry;
use serde_json::json;

use rstest::*;

fn declare_classes() {
	let _ = ClassBuilder::new("BarcodeForm")
		.attribute("code")
		.attribute("label")
		.attribute("order_id")
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
		.register()
		.unwrap();
}

#[fixture]
fn store() -> MemoryStore {
	declare_classes();
	MemoryStore::new()
}

fn new_order() -> Record {
	Record::new(registry::lookup("OrderForm").unwrap())
}

fn persisted_order(id: i64) -> Record {
	let order = new_order();
	order.set("id", json!(id));
	order
}

fn new_barcode(code: &str) -> Record {
	let record = Record::new(registry::lookup("BarcodeForm").unwrap());
	record.set("code", json!(code));
	record
}

fn seed_barcode(store: &MemoryStore, order_id: i64, code: &str) -> i64 {
	store.seed(
		"BarcodeForm",
		[
			("code".to_string(), json!(code)),
			("order_id".to_string(), json!(order_id)),
		]
		.into_iter()
		.collect(),
	)
}

fn codes(records: &[Record]) -> Vec<String> {
	records
		.iter()
		.map(|record| record.get("code").and_then(|v| v.as_str().map(String::from)).unwrap_or_default())
		.collect()
}

// =============================================================================
// Building and appending
// =============================================================================

#[rstest]
fn test_build_appends_without_storage(store: MemoryStore) {
	let order = new_order();
	let barcodes = order.collection("barcodes").unwrap();

	let built = barcodes
		.build(&store, [("code".to_string(), json!("a1"))].into_iter().collect())
		.unwrap();
	assert!(built.is_new_record());
	assert_eq!(barcodes.records(&store).unwrap().len(), 1);
	assert_eq!(store.calls().inserts, 0);
	assert_eq!(store.calls().finds, 0);

	// Inverse linked in memory.
	let back = built.related(&store, "order").unwrap().unwrap();
	assert!(back.same_record(&order));
}

#[rstest]
fn test_concat_on_unpersisted_owner_is_in_memory(store: MemoryStore) {
	let order = new_order();
	let barcodes = order.collection("barcodes").unwrap();

	barcodes.concat(&store, vec![new_barcode("a1"), new_barcode("a2")]).unwrap();
	assert_eq!(barcodes.records(&store).unwrap().len(), 2);
	assert_eq!(store.calls().inserts, 0);
	assert_eq!(store.calls().transactions, 0);
}

#[rstest]
fn test_concat_on_persisted_owner_inserts_each(store: MemoryStore) {
	let order = persisted_order(1);
	let barcodes = order.collection("barcodes").unwrap();

	barcodes.push(&store, new_barcode("a1")).unwrap();
	assert_eq!(store.calls().inserts, 1);
	// A single mutating call needs no transactional scope.
	assert_eq!(store.calls().transactions, 0);

	barcodes.concat(&store, vec![new_barcode("a2"), new_barcode("a3")]).unwrap();
	assert_eq!(store.calls().inserts, 3);
	assert_eq!(store.calls().transactions, 1);

	// Inserted rows carry the owner's foreign key.
	let rows = store.find(&AssociationScope::new("BarcodeForm", "order_id", Some(1)), None).unwrap();
	assert_eq!(rows.len(), 3);
}

// =============================================================================
// Loading and merging
// =============================================================================

#[rstest]
fn test_forced_load_merges_unsaved_records_to_the_tail(store: MemoryStore) {
	let order = persisted_order(1);
	let barcodes = order.collection("barcodes").unwrap();

	// Loaded while empty, then a record is built in memory.
	assert!(barcodes.records(&store).unwrap().is_empty());
	barcodes
		.build(&store, [("code".to_string(), json!("new-a"))].into_iter().collect())
		.unwrap();

	seed_barcode(&store, 1, "db-b");
	let merged = barcodes.load(&store, true).unwrap();
	assert_eq!(codes(&merged), vec!["db-b", "new-a"]);
	assert!(merged[0].is_persisted());
	assert!(merged[1].is_new_record());
}

#[rstest]
fn test_merge_keeps_unsaved_edits_and_refreshes_the_rest(store: MemoryStore) {
	let order = persisted_order(1);
	let id = store.seed(
		"BarcodeForm",
		[
			("code".to_string(), json!("original")),
			("label".to_string(), json!("shelf")),
			("order_id".to_string(), json!(1)),
		]
		.into_iter()
		.collect(),
	);
	let barcodes = order.collection("barcodes").unwrap();

	let loaded = barcodes.records(&store).unwrap();
	let record = loaded[0].clone();
	record.set("code", json!("edited"));

	// The row changes upstream before the next load.
	store.seed(
		"BarcodeForm",
		[
			("id".to_string(), json!(id)),
			("code".to_string(), json!("upstream")),
			("label".to_string(), json!("bin")),
			("order_id".to_string(), json!(1)),
		]
		.into_iter()
		.collect(),
	);

	let merged = barcodes.load(&store, true).unwrap();
	assert_eq!(merged.len(), 1);
	// Same object, unsaved edit preserved, untouched attribute refreshed.
	assert!(merged[0].same_record(&record));
	assert_eq!(merged[0].get("code"), Some(json!("edited")));
	assert_eq!(merged[0].get("label"), Some(json!("bin")));
}

#[rstest]
fn test_merge_never_duplicates_identities(store: MemoryStore) {
	let order = persisted_order(1);
	seed_barcode(&store, 1, "a");
	seed_barcode(&store, 1, "b");
	let barcodes = order.collection("barcodes").unwrap();

	let first = barcodes.records(&store).unwrap();
	let second = barcodes.load(&store, true).unwrap();
	assert_eq!(first.len(), 2);
	assert_eq!(second.len(), 2);

	let mut keys: Vec<_> = second.iter().map(Record::key).collect();
	keys.dedup();
	assert_eq!(keys.len(), 2);
}

#[rstest]
fn test_persisting_the_owner_makes_the_collection_stale(store: MemoryStore) {
	let order = new_order();
	let barcodes = order.collection("barcodes").unwrap();

	barcodes
		.build(&store, [("code".to_string(), json!("mem"))].into_iter().collect())
		.unwrap();
	assert_eq!(barcodes.records(&store).unwrap().len(), 1);
	assert_eq!(store.calls().finds, 0);

	// The owner gains an identity; rows now exist for it upstream.
	order.set("id", json!(7));
	seed_barcode(&store, 7, "db");
	let merged = barcodes.records(&store).unwrap();
	assert_eq!(codes(&merged), vec!["db", "mem"]);
	assert_eq!(store.calls().finds, 1);
}

// =============================================================================
// Replace
// =============================================================================

#[rstest]
fn test_replace_on_unpersisted_owner_never_touches_storage(store: MemoryStore) {
	let order = new_order();
	let barcodes = order.collection("barcodes").unwrap();
	barcodes.concat(&store, vec![new_barcode("old")]).unwrap();

	barcodes.replace(&store, vec![new_barcode("x"), new_barcode("y")]).unwrap();
	assert_eq!(codes(&barcodes.records(&store).unwrap()), vec!["x", "y"]);
	assert_eq!(store.calls().inserts, 0);
	assert_eq!(store.calls().deletes, 0);
	assert_eq!(store.calls().transactions, 0);
}

#[rstest]
fn test_replace_with_no_identity_diff_opens_no_transaction(store: MemoryStore) {
	let order = persisted_order(1);
	seed_barcode(&store, 1, "a");
	let barcodes = order.collection("barcodes").unwrap();

	let current = barcodes.records(&store).unwrap();
	barcodes.replace(&store, current).unwrap();
	assert_eq!(store.calls().transactions, 0);
	assert_eq!(store.calls().inserts, 0);
}

#[rstest]
fn test_replace_diff_runs_in_one_batch(store: MemoryStore) {
	let order = persisted_order(1);
	let kept_id = seed_barcode(&store, 1, "kept");
	seed_barcode(&store, 1, "dropped");
	let barcodes = order.collection("barcodes").unwrap();

	let current = barcodes.records(&store).unwrap();
	let kept = current
		.iter()
		.find(|record| record.identity() == Some(kept_id))
		.cloned()
		.unwrap();

	barcodes.replace(&store, vec![kept.clone(), new_barcode("added")]).unwrap();
	assert_eq!(store.calls().transactions, 1);
	assert_eq!(store.calls().inserts, 1);
	assert_eq!(store.calls().deletes, 1);
	assert_eq!(codes(&barcodes.records(&store).unwrap()), vec!["kept", "added"]);
}

#[rstest]
fn test_failed_replace_rolls_back_and_reports_not_saved(store: MemoryStore) {
	let order = persisted_order(1);
	seed_barcode(&store, 1, "stable");
	let barcodes = order.collection("barcodes").unwrap();
	let original = barcodes.records(&store).unwrap();

	store.fail_inserts(true);
	let result = barcodes.replace(&store, vec![new_barcode("doomed")]);
	assert!(matches!(result, Err(FormError::NotSaved { .. })));

	// The in-memory target is back to its pre-replace snapshot.
	let after = barcodes.records(&store).unwrap();
	assert_eq!(codes(&after), codes(&original));
	assert!(after[0].same_record(&original[0]));
}

// =============================================================================
// Removal
// =============================================================================

#[rstest]
fn test_delete_batches_persisted_removals(store: MemoryStore) {
	let order = persisted_order(1);
	let id = seed_barcode(&store, 1, "a");
	seed_barcode(&store, 1, "b");
	let barcodes = order.collection("barcodes").unwrap();

	let records = barcodes.records(&store).unwrap();
	barcodes.delete(&store, records.clone(), RemovalMode::Delete).unwrap();
	assert_eq!(store.calls().transactions, 1);
	assert!(barcodes.records(&store).unwrap().is_empty());
	assert!(store.row("BarcodeForm", id).is_none());
}

#[rstest]
fn test_nullify_unlinks_but_keeps_rows(store: MemoryStore) {
	let order = persisted_order(1);
	let id = seed_barcode(&store, 1, "a");
	let barcodes = order.collection("barcodes").unwrap();

	let records = barcodes.records(&store).unwrap();
	barcodes.delete(&store, records, RemovalMode::Nullify).unwrap();
	let row = store.row("BarcodeForm", id).unwrap();
	assert_eq!(row.get("order_id"), Some(&serde_json::Value::Null));
}

#[rstest]
fn test_deleting_unsaved_records_skips_storage(store: MemoryStore) {
	let order = new_order();
	let barcodes = order.collection("barcodes").unwrap();
	let built = barcodes
		.build(&store, [("code".to_string(), json!("a"))].into_iter().collect())
		.unwrap();

	barcodes.delete(&store, vec![built], RemovalMode::Destroy).unwrap();
	assert!(barcodes.records(&store).unwrap().is_empty());
	assert_eq!(store.calls().deletes, 0);
	assert_eq!(store.calls().transactions, 0);
}

// =============================================================================
// Cardinality
// =============================================================================

#[rstest]
fn test_len_delegates_a_count_when_unloaded(store: MemoryStore) {
	let order = persisted_order(1);
	seed_barcode(&store, 1, "a");
	seed_barcode(&store, 1, "b");
	let barcodes = order.collection("barcodes").unwrap();

	assert_eq!(barcodes.len(&store).unwrap(), 2);
	assert_eq!(store.calls().counts, 1);
	assert_eq!(store.calls().finds, 0);

	// Once loaded, length comes from the target.
	barcodes.records(&store).unwrap();
	assert_eq!(barcodes.len(&store).unwrap(), 2);
	assert_eq!(store.calls().counts, 1);
}

#[rstest]
fn test_len_counts_unsaved_members_on_top(store: MemoryStore) {
	let order = persisted_order(1);
	seed_barcode(&store, 1, "a");
	let barcodes = order.collection("barcodes").unwrap();

	// Building does not load; the unsaved member sits in the unloaded
	// target and the persisted part is still counted through the store.
	barcodes
		.build(&store, [("code".to_string(), json!("mem"))].into_iter().collect())
		.unwrap();
	assert!(!barcodes.is_loaded().unwrap());
	assert_eq!(barcodes.len(&store).unwrap(), 2);
	assert_eq!(store.calls().counts, 1);
	assert_eq!(store.calls().finds, 0);
	assert!(!barcodes.is_empty(&store).unwrap());
}
