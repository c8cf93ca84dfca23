use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use url::Url;
use uuid::Uuid;

use crate::controller::{MemoryAllocation, QuotaAccounting};

/// Sentinel length for "until EOF" items whose extent is not yet known.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

pub type ItemId = u64;

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Merged set of written byte ranges for a pending buffer. Tracks
/// coverage, not a count: rewriting a range never makes an untouched
/// region look populated.
#[derive(Debug, Clone, Default)]
pub struct WriteMap {
    /// Disjoint, sorted half-open ranges. Touching ranges are merged.
    ranges: Vec<(u64, u64)>,
}

impl WriteMap {
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = (start, end);
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e < merged.0 || s > merged.1 {
                ranges.push((s, e));
            } else {
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
            }
        }
        ranges.push(merged);
        ranges.sort_unstable();
        self.ranges = ranges;
    }

    /// True when `[0, len)` is fully written.
    pub fn covers(&self, len: u64) -> bool {
        len == 0
            || self
                .ranges
                .first()
                .map(|&(start, end)| start == 0 && end >= len)
                .unwrap_or(false)
    }
}

/// One contiguous chunk of source data. Immutable once its owning item is
/// populated, except `BytesPending` which is written during population,
/// and the Bytes -> File swap performed by eviction.
#[derive(Debug, Clone)]
pub enum DataElement {
    /// Populated in-memory bytes.
    Bytes(Arc<Vec<u8>>),
    /// Memory-backed bytes awaiting population. The buffer is allocated
    /// when memory quota is granted.
    BytesPending {
        len: u64,
        buf: Option<Vec<u8>>,
        written: WriteMap,
    },
    /// A byte range of a file on disk.
    File {
        file: FileHandle,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    },
    /// A byte range of a sandboxed-filesystem URL.
    FileSystemUrl {
        url: Url,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    },
    /// A byte range of an OS disk-cache entry.
    DiskCacheEntry {
        handle: u64,
        stream: i32,
        side_stream: i32,
        offset: u64,
        len: u64,
    },
    /// A byte range of another blob. Builder-level only; flattening
    /// resolves every reference before items are registered.
    Blob { uuid: Uuid, offset: u64, len: u64 },
}

impl DataElement {
    pub fn len(&self) -> u64 {
        match self {
            DataElement::Bytes(data) => data.len() as u64,
            DataElement::BytesPending { len, .. } => *len,
            DataElement::File { len, .. } => *len,
            DataElement::FileSystemUrl { len, .. } => *len,
            DataElement::DiskCacheEntry { len, .. } => *len,
            DataElement::Blob { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes and pending bytes live in the memory budget.
    pub fn is_memory_backed(&self) -> bool {
        matches!(
            self,
            DataElement::Bytes(_) | DataElement::BytesPending { .. }
        )
    }
}

/// Backing file of a `File` element. Page files and transport files are
/// owned: the last clone to drop deletes the file and returns its disk
/// quota. Caller-provided files are unowned paths.
#[derive(Debug, Clone)]
pub enum FileHandle {
    Unowned(PathBuf),
    Owned(Arc<PageFileRef>),
    /// Transport file not yet created; replaced when file quota is granted.
    Pending,
}

impl FileHandle {
    pub fn path(&self) -> Option<&Path> {
        match self {
            FileHandle::Unowned(path) => Some(path),
            FileHandle::Owned(file) => Some(file.path()),
            FileHandle::Pending => None,
        }
    }
}

/// Refcounted reference to a store-owned file. Disk accounting is charged
/// by whoever creates the file; the final drop releases it and removes the
/// file, so deletion follows the last referencing item, not any one blob.
#[derive(Debug)]
pub struct PageFileRef {
    path: PathBuf,
    size: u64,
    accounting: Arc<QuotaAccounting>,
}

impl PageFileRef {
    pub(crate) fn new(path: PathBuf, size: u64, accounting: Arc<QuotaAccounting>) -> Arc<Self> {
        Arc::new(Self {
            path,
            size,
            accounting,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for PageFileRef {
    fn drop(&mut self) {
        self.accounting.release_disk(self.size);
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove page file");
        }
    }
}

/// Quota / population state of a shareable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Memory-backed, no quota yet.
    QuotaNeeded,
    /// Sitting in the controller's FIFO quota queue.
    QuotaRequested,
    /// Quota held, data not yet populated.
    QuotaGranted,
    /// Populated and holding memory quota. Eligible for LRU paging.
    PopulatedWithQuota,
    /// Populated without memory quota (file-backed and friends).
    PopulatedWithoutQuota,
}

pub(crate) struct ItemInner {
    pub element: DataElement,
    pub state: ItemState,
    /// RAII memory grant. Dropping it returns quota to the controller.
    pub allocation: Option<MemoryAllocation>,
    /// Uuids of blobs currently referencing this item.
    pub blob_refs: HashSet<Uuid>,
    /// Set while an eviction batch is writing this item out.
    pub paging_out: bool,
    /// Set by `populate_future_file` for file-based transport items.
    pub transport_done: bool,
}

/// A refcounted unit of backing data, shareable across blobs. The longest
/// living referencing blob keeps it alive.
pub struct ShareableItem {
    id: ItemId,
    inner: Mutex<ItemInner>,
}

impl ShareableItem {
    pub(crate) fn new(element: DataElement, state: ItemState) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(ItemInner {
                element,
                state,
                allocation: None,
                blob_refs: HashSet::new(),
                paging_out: false,
                transport_done: false,
            }),
        })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.lock().element.len()
    }

    pub fn state(&self) -> ItemState {
        self.lock().state
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ItemInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn add_ref(&self, uuid: Uuid) {
        self.lock().blob_refs.insert(uuid);
    }

    /// Removes a referencing blob. Returns true when no references remain.
    pub(crate) fn remove_ref(&self, uuid: &Uuid) -> bool {
        let mut inner = self.lock();
        inner.blob_refs.remove(uuid);
        inner.blob_refs.is_empty()
    }
}

impl std::fmt::Debug for ShareableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ShareableItem")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("len", &inner.element.len())
            .field("refs", &inner.blob_refs.len())
            .finish()
    }
}
