use std::sync::Arc;

use uuid::Uuid;

use crate::context::{CompletionCallback, TransportCallback};
use crate::controller::TransportStrategy;
use crate::item::{DataElement, ShareableItem, UNKNOWN_SIZE};

/// Terminal failure reasons. Once a blob is broken it stays broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobError {
    /// Quota could not and will never fit.
    OutOfMemory,
    /// Malformed input: self-reference, bad range, overflowed size,
    /// malformed transport response.
    InvalidConstructionArguments,
    /// A depended-upon blob is itself broken.
    ReferencedBlobBroken,
    /// The transport collaborator disappeared mid-transfer.
    SourceDiedInTransit,
}

/// Build state machine. Pending states only ever move forward or into a
/// broken state; `Done` and `Broken` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    PendingQuota,
    PendingTransport,
    PendingInternals,
    Done,
    Broken(BlobError),
}

impl BlobStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            BlobStatus::PendingQuota | BlobStatus::PendingTransport | BlobStatus::PendingInternals
        )
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, BlobStatus::Broken(_))
    }
}

/// A deferred byte-range copy from a populated source item into a
/// `BytesPending` placeholder, executed during finalization.
#[derive(Debug)]
pub(crate) struct ItemCopy {
    pub source: Arc<ShareableItem>,
    pub source_offset: u64,
    pub dest: Arc<ShareableItem>,
}

/// Per-build bookkeeping, present only while the entry is pending and
/// released exactly once by finish or cancel.
pub(crate) struct BuildingState {
    /// Items awaiting external population, in builder future order.
    pub transport_items: Vec<Arc<ShareableItem>>,
    /// Future-data slots in builder order, populated or not. Population
    /// indices address this list, not `transport_items`.
    pub data_slots: Vec<Arc<ShareableItem>>,
    pub copies: Vec<ItemCopy>,
    /// Referenced blobs, kept alive by one refcount each until release.
    pub dependencies: Vec<Uuid>,
    pub pending_dependent_count: usize,
    /// Blobs waiting on this one to finish.
    pub waiters: Vec<Uuid>,
    /// Queued memory request, cancellable until granted.
    pub memory_request: Option<u64>,
    /// Outstanding quota grants (memory and/or transport files).
    pub pending_quota_ops: usize,
    pub strategy: TransportStrategy,
    pub transport_callback: Option<TransportCallback>,
    pub completion_callbacks: Vec<CompletionCallback>,
}

/// The persistent record of one blob.
pub struct BlobEntry {
    uuid: Uuid,
    pub content_type: String,
    pub content_disposition: String,
    pub(crate) items: Vec<Arc<ShareableItem>>,
    /// Prefix sums: `offsets[i]` is the start offset of item `i + 1`.
    pub(crate) offsets: Vec<u64>,
    pub(crate) total_size: u64,
    pub(crate) refcount: u64,
    pub(crate) status: BlobStatus,
    pub(crate) building: Option<BuildingState>,
}

impl BlobEntry {
    pub(crate) fn new(uuid: Uuid, content_type: String, content_disposition: String) -> Self {
        Self {
            uuid,
            content_type,
            content_disposition,
            items: Vec::new(),
            offsets: Vec::new(),
            total_size: 0,
            refcount: 1,
            status: BlobStatus::PendingQuota,
            building: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn status(&self) -> BlobStatus {
        self.status
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn refcount(&self) -> u64 {
        self.refcount
    }

    pub(crate) fn items(&self) -> &[Arc<ShareableItem>] {
        &self.items
    }

    /// Installs the resolved item list and recomputes the prefix sums used
    /// for binary-search slicing.
    pub(crate) fn set_items(&mut self, items: Vec<Arc<ShareableItem>>, total_size: u64) {
        self.offsets.clear();
        if total_size != UNKNOWN_SIZE {
            let mut acc = 0u64;
            for item in items.iter().take(items.len().saturating_sub(1)) {
                acc = acc.saturating_add(item.len());
                self.offsets.push(acc);
            }
        }
        self.items = items;
        self.total_size = total_size;
    }

    pub(crate) fn clear_items(&mut self) -> Vec<Arc<ShareableItem>> {
        self.offsets.clear();
        self.total_size = 0;
        std::mem::take(&mut self.items)
    }
}

/// Read-only view of a finished blob. Cloned elements keep owned page
/// files alive, so a snapshot stays readable even if the blob is dropped.
#[derive(Debug, Clone)]
pub struct BlobSnapshot {
    pub uuid: Uuid,
    pub content_type: String,
    pub content_disposition: String,
    pub total_size: u64,
    pub items: Vec<DataElement>,
}
