//! Eviction batch selection and page-file writing. Selection runs under
//! the core lock; the write itself runs on the background runner and is
//! committed by the storage context when it completes.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::entry::BlobStatus;
use crate::item::{DataElement, ItemState, ShareableItem};
use crate::registry::Registry;

use super::MemoryController;

/// One batch of LRU items being written out to a single page file.
pub(crate) struct EvictionBatch {
    pub path: PathBuf,
    pub items: Vec<Arc<ShareableItem>>,
    /// Data snapshots, in item order. Cheap clones of the backing arcs.
    pub segments: Vec<Arc<Vec<u8>>>,
    pub sizes: Vec<u64>,
    pub total: u64,
}

/// Picks least-recently-used populated bytes items until the batch reaches
/// `min_page_file_size`. A smaller batch is never written: paging out tiny
/// files fragments the disk budget without relieving memory pressure.
///
/// Items referenced by a still-building blob are skipped; a pending blob
/// may still need their bytes for its finalization copies.
pub(crate) fn select_batch(
    controller: &mut MemoryController,
    registry: &Registry,
) -> Option<EvictionBatch> {
    if !controller.needs_eviction() {
        return None;
    }

    let min_batch = controller.limits().min_page_file_size;
    let mut selected: Vec<Arc<ShareableItem>> = Vec::new();
    let mut segments: Vec<Arc<Vec<u8>>> = Vec::new();
    let mut sizes: Vec<u64> = Vec::new();
    let mut total = 0u64;

    for item in controller.lru.iter() {
        let inner = item.lock();
        if inner.state != ItemState::PopulatedWithQuota || inner.paging_out {
            continue;
        }
        let DataElement::Bytes(data) = &inner.element else {
            continue;
        };
        let busy = inner.blob_refs.iter().any(|uuid| {
            registry
                .get(uuid)
                .map(|entry| entry.status() != BlobStatus::Done)
                .unwrap_or(false)
        });
        if busy {
            continue;
        }
        let len = data.len() as u64;
        segments.push(data.clone());
        sizes.push(len);
        drop(inner);
        selected.push(item.clone());
        total = total.saturating_add(len);
        if total >= min_batch {
            break;
        }
    }

    if total < min_batch {
        return None;
    }

    for item in &selected {
        item.lock().paging_out = true;
    }
    controller.pending_evictions = true;
    let path = controller.next_page_file_path();
    tracing::debug!(
        path = %path.display(),
        items = selected.len(),
        total,
        "eviction batch scheduled"
    );

    Some(EvictionBatch {
        path,
        items: selected,
        segments,
        sizes,
        total,
    })
}

/// Writes every segment of the batch into one new page file.
pub(crate) async fn write_page_file(
    path: &PathBuf,
    segments: &[Arc<Vec<u8>>],
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    for segment in segments {
        file.write_all(segment).await?;
    }
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageLimits;
    use crate::entry::BlobEntry;
    use uuid::Uuid;

    fn controller(min_page: u64) -> MemoryController {
        MemoryController::new(StorageLimits {
            storage_dir: "/tmp/blobstore_evict_test".into(),
            max_blob_memory_space: 100,
            min_page_file_size: min_page,
            ..StorageLimits::default()
        })
    }

    fn populated_item(len: usize) -> Arc<ShareableItem> {
        let item = ShareableItem::new(
            DataElement::Bytes(Arc::new(vec![0x5a; len])),
            ItemState::PopulatedWithQuota,
        );
        item
    }

    #[test]
    fn test_no_batch_below_minimum() {
        let mut controller = controller(50);
        let registry = Registry::default();
        let items = vec![populated_item(60), populated_item(30)];
        assert!(matches!(
            controller.reserve_memory(Uuid::new_v4(), items.clone(), 90),
            super::super::MemoryReservation::Granted
        ));
        // Only the 30-byte item is in the LRU: under the 50-byte minimum.
        controller.note_items_used(&items[1..]);
        assert!(controller.needs_eviction());
        assert!(select_batch(&mut controller, &registry).is_none());
    }

    #[test]
    fn test_batch_takes_lru_order_until_minimum() {
        let mut controller = controller(50);
        let registry = Registry::default();
        let items = vec![populated_item(30), populated_item(30), populated_item(30)];
        assert!(matches!(
            controller.reserve_memory(Uuid::new_v4(), items.clone(), 90),
            super::super::MemoryReservation::Granted
        ));
        controller.note_items_used(&items);
        // Touch the first item again: it becomes most recent.
        controller.note_items_used(&items[..1]);

        let batch = select_batch(&mut controller, &registry).expect("batch");
        assert_eq!(batch.total, 60);
        assert_eq!(batch.items[0].id(), items[1].id());
        assert_eq!(batch.items[1].id(), items[2].id());
        assert!(batch.items[0].lock().paging_out);
        assert!(controller.pending_evictions);
        // Re-entrancy guard: no second batch while one is in flight.
        assert!(select_batch(&mut controller, &registry).is_none());
    }

    #[test]
    fn test_items_of_building_blobs_are_skipped() {
        let mut controller = controller(20);
        let mut registry = Registry::default();
        let building = Uuid::new_v4();
        registry.insert(BlobEntry::new(building, String::new(), String::new()));

        let items = vec![populated_item(90)];
        assert!(matches!(
            controller.reserve_memory(Uuid::new_v4(), items.clone(), 90),
            super::super::MemoryReservation::Granted
        ));
        items[0].add_ref(building);
        controller.note_items_used(&items);

        assert!(controller.needs_eviction());
        assert!(select_batch(&mut controller, &registry).is_none());
    }
}
