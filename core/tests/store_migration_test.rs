//! Store opening and schema upgrade tests
//!
//! Exercises the standard migration catalog through the store manager:
//! upgrades that keep existing records, version monotonicity, blocked opens
//! and the rewrite of legacy integer-keyed outbox entries.

mod helpers;

use helpers::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tether_core::infra::{
	db::{migration, OpenError, RecordKey, StoreEvent, StoreHandle, TxMode},
	sync::{EntryStatus, FakeTimeSource, Operation, SyncQueue, SYNC_QUEUE},
};
use tokio::sync::broadcast;

fn drain(events: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
	let mut seen = Vec::new();
	while let Ok(event) = events.try_recv() {
		seen.push(event);
	}
	seen
}

fn index_names(handle: &StoreHandle, collection: &str) -> Vec<String> {
	handle
		.collection(collection)
		.unwrap()
		.indexes
		.iter()
		.map(|index| index.name.clone())
		.collect()
}

async fn seed_business_records(handle: &StoreHandle) {
	let scope = handle
		.transaction(&["invoices", "customers"], TxMode::ReadWrite)
		.await
		.unwrap();
	scope
		.put(
			"invoices",
			json!({"id": "inv-1", "customerId": "c-1", "total": 120}),
		)
		.await
		.unwrap();
	scope
		.put("customers", json!({"id": "c-1", "name": "Acme"}))
		.await
		.unwrap();
	scope.commit().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_to_v2_adds_sync_queue_and_keeps_records() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);

	let v1 = manager.open("shop", 1).await.unwrap();
	assert!(v1.has_collection("invoices"));
	assert!(v1.has_collection("customers"));
	assert!(!v1.has_collection(SYNC_QUEUE));
	seed_business_records(&v1).await;
	v1.close();

	let v2 = manager.open("shop", 2).await.unwrap();
	assert_eq!(v2.version(), 2);
	assert_eq!(index_names(&v2, "invoices"), ["customerId"]);

	let mut queue_indexes = index_names(&v2, SYNC_QUEUE);
	queue_indexes.sort();
	assert_eq!(queue_indexes, ["retryCount", "status", "timestamp"]);

	let scope = v2
		.transaction(&["invoices", "customers", SYNC_QUEUE], TxMode::ReadOnly)
		.await
		.unwrap();
	let invoice = scope
		.get("invoices", &RecordKey::from("inv-1"))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(
		invoice.value,
		json!({"id": "inv-1", "customerId": "c-1", "total": 120})
	);
	assert_eq!(scope.count("customers").await.unwrap(), 1);
	assert_eq!(
		scope
			.get_all_by_index("invoices", "customerId", &json!("c-1"))
			.await
			.unwrap()
			.len(),
		1
	);
	assert!(scope
		.get_all_by_index(SYNC_QUEUE, "status", &json!("pending"))
		.await
		.unwrap()
		.is_empty());
	scope.commit().await.unwrap();
}

#[tokio::test]
async fn test_versions_only_move_forward() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);

	let mut observed = Vec::new();
	for target in [1, 1, 2, 3, migration::CURRENT_VERSION] {
		let handle = manager.open("shop", target).await.unwrap();
		let on_disk = handle.on_disk_version().await.unwrap();
		assert!(on_disk <= target);
		observed.push(on_disk);
		handle.close();
	}
	assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
	assert_eq!(observed.last(), Some(&migration::CURRENT_VERSION));

	let error = manager.open("shop", 2).await.unwrap_err();
	assert!(matches!(
		error,
		OpenError::VersionTooNew {
			on_disk: 4,
			requested: 2,
			..
		}
	));
	assert!(!error.is_retryable());

	let handle = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	assert_eq!(
		handle.on_disk_version().await.unwrap(),
		migration::CURRENT_VERSION
	);
}

#[tokio::test]
async fn test_reopen_at_same_version_runs_no_migration() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);
	let mut events = manager.events().subscribe();

	let first = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	seed_business_records(&first).await;
	first.close();

	let upgrades = drain(&mut events)
		.into_iter()
		.filter(|event| matches!(event, StoreEvent::Upgraded { .. }))
		.count();
	assert_eq!(upgrades, 1);

	let second = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	assert!(!drain(&mut events)
		.iter()
		.any(|event| matches!(event, StoreEvent::UpgradeNeeded { .. })));

	let scope = second
		.transaction(&["invoices"], TxMode::ReadOnly)
		.await
		.unwrap();
	assert_eq!(scope.count("invoices").await.unwrap(), 1);
	scope.commit().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_opens_upgrade_once() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);
	let mut events = manager.events().subscribe();

	let (first, second) = tokio::join!(
		manager.open("shop", migration::CURRENT_VERSION),
		manager.open("shop", migration::CURRENT_VERSION)
	);
	let (first, second) = (first.unwrap(), second.unwrap());
	assert_eq!(manager.open_handles("shop"), 2);

	let upgrades: Vec<_> = drain(&mut events)
		.into_iter()
		.filter(|event| matches!(event, StoreEvent::Upgraded { .. }))
		.collect();
	assert_eq!(
		upgrades,
		[StoreEvent::Upgraded {
			store: "shop".to_string(),
			old_version: 0,
			new_version: migration::CURRENT_VERSION,
		}]
	);

	first.close();
	second.close();
	assert_eq!(manager.open_handles("shop"), 0);
}

#[tokio::test]
async fn test_older_handle_blocks_upgrade_until_closed() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);
	let mut events = manager.events().subscribe();

	let old = manager.open("shop", 2).await.unwrap();
	let mut version_changes = old.version_changes();

	let error = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap_err();
	assert!(error.is_retryable());
	assert!(matches!(error, OpenError::Blocked { holders: 1, .. }));

	let request = version_changes.try_recv().unwrap();
	assert_eq!(request.old_version, 2);
	assert_eq!(request.new_version, migration::CURRENT_VERSION);
	assert!(drain(&mut events)
		.iter()
		.any(|event| matches!(event, StoreEvent::Blocked { holders: 1, .. })));

	// Nothing was migrated while blocked
	assert_eq!(old.on_disk_version().await.unwrap(), 2);

	old.close();
	let upgraded = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	assert_eq!(upgraded.version(), migration::CURRENT_VERSION);
}

#[tokio::test]
async fn test_handle_closing_on_version_change_unblocks_upgrade() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);

	let old = manager.open("shop", 1).await.unwrap();
	let mut version_changes = old.version_changes();
	let closer = tokio::spawn(async move {
		if version_changes.recv().await.is_ok() {
			old.close();
		}
	});

	let upgraded = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	assert_eq!(upgraded.version(), migration::CURRENT_VERSION);
	closer.await.unwrap();
}

#[tokio::test]
async fn test_legacy_outbox_entries_are_rekeyed() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);

	let v2 = manager.open("shop", 2).await.unwrap();
	let scope = v2
		.transaction(&["invoices", SYNC_QUEUE], TxMode::ReadWrite)
		.await
		.unwrap();
	scope
		.put("invoices", json!({"id": "inv-1", "total": 40}))
		.await
		.unwrap();
	let first = scope
		.put(
			SYNC_QUEUE,
			json!({
				"type": "invoices",
				"action": "create",
				"data": {"id": "inv-1", "total": 40},
				"timestamp": 500,
				"status": "pending",
				"retryCount": 1
			}),
		)
		.await
		.unwrap();
	let second = scope
		.put(
			SYNC_QUEUE,
			json!({
				"type": "invoices",
				"action": "update",
				"data": {"id": "inv-1", "total": 45},
				"timestamp": 600,
				"status": "pending"
			}),
		)
		.await
		.unwrap();
	scope.commit().await.unwrap();
	assert_eq!((first, second), (RecordKey::Int(1), RecordKey::Int(2)));
	v2.close();

	let current = manager
		.open("shop", migration::CURRENT_VERSION)
		.await
		.unwrap();
	let queue = SyncQueue::new(current.clone(), Arc::new(FakeTimeSource::new(1_000))).unwrap();

	let entries = queue.list(None).await.unwrap();
	let ids: Vec<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
	assert_eq!(ids, ["sync_1", "sync_2"]);
	assert_eq!(entries[0].operation, Operation::Create);
	assert_eq!(entries[0].retry_count, 1);
	assert_eq!(entries[1].operation, Operation::Update);
	assert!(entries
		.iter()
		.all(|entry| entry.status == EntryStatus::Pending && entry.collection == "invoices"));

	// The new target index finds legacy entries by their record
	let for_record = queue
		.entries_for("invoices", &RecordKey::from("inv-1"))
		.await
		.unwrap();
	assert_eq!(for_record.len(), 2);

	// Only the earliest change per record is replayable
	let batch = queue.next_batch(10).await.unwrap();
	assert_eq!(batch.len(), 1);
	assert_eq!(batch[0].id, "sync_1");

	let scope = current
		.transaction(&["invoices"], TxMode::ReadOnly)
		.await
		.unwrap();
	let invoice = scope
		.get("invoices", &RecordKey::from("inv-1"))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(invoice.value["synced"], json!(false));
	scope.commit().await.unwrap();
}

#[tokio::test]
async fn test_unknown_version_and_invalid_name() {
	let temp = TempDir::new().unwrap();
	let manager = standard_manager(&temp);

	assert!(matches!(
		manager.open("shop", 99).await,
		Err(OpenError::UnknownVersion {
			requested: 99,
			latest: 4
		})
	));
	assert!(matches!(
		manager.open("shop", 0).await,
		Err(OpenError::UnknownVersion { .. })
	));
	assert!(matches!(
		manager.open("../escape", 1).await,
		Err(OpenError::InvalidName(_))
	));
}
