//! End-to-end tests driving the public surface: quota fairness, paging,
//! transport strategies and handle lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobstore::{
    BlobDataBuilder, BlobError, BlobStatus, BlobStorage, DataElement, StorageLimits,
    TransportRequest, TransportStrategy,
};
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn small_limits(dir: impl Into<std::path::PathBuf>) -> StorageLimits {
    StorageLimits {
        storage_dir: dir.into(),
        max_ipc_memory_size: 20,
        max_shared_memory_size: 1000,
        max_blob_memory_space: 100,
        effective_max_disk_space: 1000,
        min_page_file_size: 40,
        file_paging_enabled: true,
    }
}

fn finished_bytes_blob(storage: &BlobStorage, len: usize) -> blobstore::BlobHandle {
    let mut builder = BlobDataBuilder::new();
    builder.append_data(vec![0xab; len]);
    storage.add_finished_blob(builder).expect("add blob")
}

#[tokio::test]
async fn test_handle_refcount_controls_entry_lifetime() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(StorageLimits::new(dir.path()));

    let handle = finished_bytes_blob(&storage, 8);
    let uuid = handle.uuid();
    let second = handle.clone();

    drop(handle);
    // One live handle keeps the entry and its memory.
    assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
    assert_eq!(storage.memory_usage(), 8);

    drop(second);
    assert_eq!(storage.blob_status(uuid), None);
    assert_eq!(storage.memory_usage(), 0);
    assert_eq!(storage.blob_count(), 0);
}

#[tokio::test]
async fn test_memory_grants_are_fifo() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut limits = small_limits(dir.path());
    // No paging: queued requests wait for released memory only.
    limits.file_paging_enabled = false;
    let storage = BlobStorage::new(limits);

    let first = finished_bytes_blob(&storage, 80);
    assert_eq!(storage.blob_status(first.uuid()), Some(BlobStatus::Done));

    let order: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let mut queued = Vec::new();
    // 60 does not fit behind 80; 20 would, but must not jump the queue.
    for len in [60usize, 20] {
        let handle = finished_bytes_blob(&storage, len);
        let order = order.clone();
        let uuid = handle.uuid();
        storage
            .on_construction_complete(uuid, move |status| {
                assert_eq!(status, BlobStatus::Done);
                order.lock().unwrap().push(uuid);
            })
            .expect("register callback");
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::PendingQuota));
        queued.push(handle);
    }

    drop(first);
    let granted = order.lock().unwrap().clone();
    assert_eq!(granted, vec![queued[0].uuid(), queued[1].uuid()]);
    assert_eq!(storage.memory_usage(), 80);
}

#[tokio::test]
async fn test_transport_strategies_per_item() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut limits = small_limits(dir.path());
    limits.max_blob_memory_space = 1000;
    limits.file_paging_enabled = false;
    let storage = BlobStorage::new(limits);

    let mut builder = BlobDataBuilder::new();
    builder.set_content_type("application/octet-stream");
    let slots: Vec<usize> = [10u64, 20, 30]
        .iter()
        .map(|&len| builder.append_future_data(len))
        .collect();

    let request: Arc<Mutex<Option<TransportRequest>>> = Arc::new(Mutex::new(None));
    let request_slot = request.clone();
    let handle = storage
        .build_blob(
            builder,
            Some(Box::new(move |req| {
                *request_slot.lock().unwrap() = Some(req);
            })),
        )
        .expect("build");
    let uuid = handle.uuid();

    let request = request.lock().unwrap().take().expect("transport request");
    // 60 bytes in total cannot ride inline, but the two small items can.
    assert_eq!(request.strategy, TransportStrategy::SharedMemory);
    let strategies: Vec<_> = request.items.iter().map(|item| item.strategy).collect();
    assert_eq!(
        strategies,
        vec![
            TransportStrategy::Ipc,
            TransportStrategy::Ipc,
            TransportStrategy::SharedMemory
        ]
    );

    for (slot, len) in slots.iter().zip([10usize, 20, 30]) {
        storage
            .populate_future_data(uuid, *slot, &vec![slot.to_le_bytes()[0] + 1; len], 0)
            .expect("populate");
    }
    storage.notify_transport_complete(uuid).expect("notify");

    assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
    let snapshot = storage.snapshot(uuid).expect("snapshot");
    assert_eq!(snapshot.total_size, 60);
    assert_eq!(snapshot.content_type, "application/octet-stream");
    let lens: Vec<u64> = snapshot.items.iter().map(|item| item.len()).collect();
    assert_eq!(lens, vec![10, 20, 30]);
}

#[tokio::test]
async fn test_eviction_pages_bytes_to_disk_and_back_out() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(small_limits(dir.path()));

    // 80 bytes used is past the paging mark (100 - 40), so the finished
    // blob's bytes are paged out.
    let handle = finished_bytes_blob(&storage, 80);
    let uuid = handle.uuid();
    assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));

    let storage_poll = storage.clone();
    wait_for(move || storage_poll.memory_usage() == 0 && storage_poll.disk_usage() == 80).await;

    // The blob survives paging; its item is now file-backed.
    let snapshot = storage.snapshot(uuid).expect("snapshot");
    assert_eq!(snapshot.total_size, 80);
    let page_path = match &snapshot.items[0] {
        DataElement::File { file, len, .. } => {
            assert_eq!(*len, 80);
            file.path().expect("page file path").to_path_buf()
        }
        other => panic!("expected file-backed item, got {:?}", other),
    };
    assert_eq!(std::fs::metadata(&page_path).expect("page file").len(), 80);

    // Dropping the last reference deletes the page file and returns the
    // disk quota. The snapshot clone keeps it alive until dropped too.
    drop(handle);
    drop(snapshot);
    assert_eq!(storage.disk_usage(), 0);
    assert!(!page_path.exists());
}

#[tokio::test]
async fn test_eviction_frees_room_for_queued_requests() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(small_limits(dir.path()));

    let first = finished_bytes_blob(&storage, 80);
    let second = finished_bytes_blob(&storage, 60);
    assert_eq!(
        storage.blob_status(second.uuid()),
        Some(BlobStatus::PendingQuota)
    );

    // Paging the first blob out frees the memory the second one needs.
    let storage_poll = storage.clone();
    let second_uuid = second.uuid();
    wait_for(move || {
        storage_poll.blob_status(second_uuid) == Some(BlobStatus::Done)
    })
    .await;
    assert_eq!(storage.disk_usage(), 80);
    assert_eq!(storage.memory_usage(), 60);
    assert_eq!(storage.blob_status(first.uuid()), Some(BlobStatus::Done));
}

#[tokio::test]
async fn test_future_file_transport_creates_owned_files() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(small_limits(dir.path()));

    let mut builder = BlobDataBuilder::new();
    let slot = builder.append_future_file(0, 30, 0);
    let request: Arc<Mutex<Option<TransportRequest>>> = Arc::new(Mutex::new(None));
    let request_slot = request.clone();
    let handle = storage
        .build_blob(
            builder,
            Some(Box::new(move |req| {
                *request_slot.lock().unwrap() = Some(req);
            })),
        )
        .expect("build");
    let uuid = handle.uuid();

    // File creation runs in the background; the transport request fires
    // once the transport file exists.
    let storage_poll = storage.clone();
    wait_for(move || {
        storage_poll.blob_status(uuid) == Some(BlobStatus::PendingTransport)
    })
    .await;
    let request = request.lock().unwrap().take().expect("transport request");
    let path = match &request.items[0].kind {
        blobstore::TransportItemKind::File { path } => path.clone(),
        other => panic!("expected file transport, got {:?}", other),
    };
    assert!(path.exists());
    assert_eq!(storage.disk_usage(), 30);

    std::fs::write(&path, vec![0x7e; 30]).expect("fill transport file");
    storage
        .populate_future_file(uuid, slot, None)
        .expect("populate");
    storage.notify_transport_complete(uuid).expect("notify");

    assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
    let snapshot = storage.snapshot(uuid).expect("snapshot");
    assert!(matches!(snapshot.items[0], DataElement::File { .. }));

    // The transport file is store-owned: the last reference deletes it.
    drop(snapshot);
    drop(handle);
    assert!(!path.exists());
    assert_eq!(storage.disk_usage(), 0);
}

#[tokio::test]
async fn test_oversized_bytes_use_file_transport() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(small_limits(dir.path()));

    // 600 bytes never fit the 100-byte memory budget but do fit on disk,
    // so the bytes travel through a transport file.
    let mut builder = BlobDataBuilder::new();
    builder.append_future_data(600);
    let request: Arc<Mutex<Option<TransportRequest>>> = Arc::new(Mutex::new(None));
    let request_slot = request.clone();
    let handle = storage
        .build_blob(
            builder,
            Some(Box::new(move |req| {
                *request_slot.lock().unwrap() = Some(req);
            })),
        )
        .expect("build");
    let uuid = handle.uuid();

    let storage_poll = storage.clone();
    wait_for(move || {
        storage_poll.blob_status(uuid) == Some(BlobStatus::PendingTransport)
    })
    .await;
    let request = request.lock().unwrap().take().expect("transport request");
    assert_eq!(request.strategy, TransportStrategy::File);
    assert_eq!(request.items.len(), 1);
    assert_eq!(request.items[0].strategy, TransportStrategy::File);
    let path = match &request.items[0].kind {
        blobstore::TransportItemKind::File { path } => path.clone(),
        other => panic!("expected file transport, got {:?}", other),
    };
    assert!(path.exists());
    assert_eq!(storage.disk_usage(), 600);
    assert_eq!(storage.memory_usage(), 0);

    std::fs::write(&path, vec![0x5a; 600]).expect("fill transport file");
    storage
        .populate_future_file(uuid, request.items[0].index, None)
        .expect("populate");
    storage.notify_transport_complete(uuid).expect("notify");

    assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
    let snapshot = storage.snapshot(uuid).expect("snapshot");
    assert_eq!(snapshot.total_size, 600);
    assert!(matches!(snapshot.items[0], DataElement::File { .. }));

    drop(snapshot);
    drop(handle);
    assert!(!path.exists());
    assert_eq!(storage.disk_usage(), 0);
}

#[tokio::test]
async fn test_self_reference_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(StorageLimits::new(dir.path()));

    let mut builder = BlobDataBuilder::new();
    builder.append_blob(builder.uuid());
    let handle = storage.build_blob(builder, None).expect("build");
    assert_eq!(
        storage.blob_status(handle.uuid()),
        Some(BlobStatus::Broken(BlobError::InvalidConstructionArguments))
    );
    assert!(storage.snapshot(handle.uuid()).is_none());
}

#[tokio::test]
async fn test_blob_slice_copies_boundary_bytes() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = BlobStorage::new(StorageLimits::new(dir.path()));

    let mut builder = BlobDataBuilder::new();
    builder.append_data((0u8..50).collect::<Vec<u8>>());
    builder.append_data((50u8..100).collect::<Vec<u8>>());
    let source = storage.add_finished_blob(builder).expect("add source");

    // [40, 70) crosses the item boundary: both halves are partial copies.
    let mut slice_builder = BlobDataBuilder::new();
    slice_builder.append_blob_range(source.uuid(), 40, 30);
    let slice = storage.build_blob(slice_builder, None).expect("build slice");

    assert_eq!(storage.blob_status(slice.uuid()), Some(BlobStatus::Done));
    let snapshot = storage.snapshot(slice.uuid()).expect("snapshot");
    assert_eq!(snapshot.total_size, 30);
    let mut bytes = Vec::new();
    for item in &snapshot.items {
        match item {
            DataElement::Bytes(data) => bytes.extend_from_slice(data),
            other => panic!("expected bytes, got {:?}", other),
        }
    }
    assert_eq!(bytes, (40u8..70).collect::<Vec<u8>>());

    // The slice stands on its own once built.
    drop(source);
    assert!(storage.snapshot(slice.uuid()).is_some());
}

#[tokio::test]
async fn test_paging_failure_disables_paging_permanently() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    // Point the storage directory at a regular file so every page file
    // write fails.
    let bogus_dir = dir.path().join("not_a_directory");
    std::fs::write(&bogus_dir, b"occupied").expect("write");
    let storage = BlobStorage::new(small_limits(&bogus_dir));

    let handle = finished_bytes_blob(&storage, 80);
    assert_eq!(storage.blob_status(handle.uuid()), Some(BlobStatus::Done));

    let storage_poll = storage.clone();
    wait_for(move || !storage_poll.file_paging_enabled()).await;

    // Nothing was paged; the blob stays memory-backed and readable.
    assert_eq!(storage.memory_usage(), 80);
    assert_eq!(storage.disk_usage(), 0);
    let snapshot = storage.snapshot(handle.uuid()).expect("snapshot");
    assert!(matches!(snapshot.items[0], DataElement::Bytes(_)));

    // With paging gone, requests past the memory budget fail outright
    // instead of queueing for disk space.
    let too_big = finished_bytes_blob(&storage, 30);
    assert_eq!(
        storage.blob_status(too_big.uuid()),
        Some(BlobStatus::PendingQuota)
    );
    let never_fits = finished_bytes_blob(&storage, 150);
    assert_eq!(
        storage.blob_status(never_fits.uuid()),
        Some(BlobStatus::Broken(BlobError::OutOfMemory))
    );
}
