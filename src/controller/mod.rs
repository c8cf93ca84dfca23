//! Memory controller: owns the bounded memory and disk budgets, decides
//! transport strategy, grants and queues memory quota in FIFO order, and
//! drives the LRU paging pipeline together with [`eviction`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::StorageLimits;
use crate::item::{DataElement, ItemState, ShareableItem};

pub(crate) mod eviction;
pub(crate) mod lru;

use lru::LruTracker;

/// How bytes should travel from the caller into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    /// Nothing to transport, or every byte was supplied up front.
    NoneNeeded,
    /// The request can never fit in any budget.
    TooLarge,
    /// Small enough to ride inline in a request.
    Ipc,
    /// Transported through shared memory segments.
    SharedMemory,
    /// Transported by writing into store-provided files.
    File,
}

/// Live byte counters shared with RAII grants and page-file references, so
/// releases stay correct no matter which component drops last.
#[derive(Debug, Default)]
pub struct QuotaAccounting {
    memory_used: AtomicU64,
    disk_used: AtomicU64,
}

impl QuotaAccounting {
    pub fn memory_used(&self) -> u64 {
        self.memory_used.load(Ordering::SeqCst)
    }

    pub fn disk_used(&self) -> u64 {
        self.disk_used.load(Ordering::SeqCst)
    }

    pub(crate) fn add_memory(&self, size: u64) {
        self.memory_used.fetch_add(size, Ordering::SeqCst);
    }

    pub(crate) fn release_memory(&self, size: u64) {
        self.memory_used.fetch_sub(size, Ordering::SeqCst);
    }

    pub(crate) fn add_disk(&self, size: u64) {
        self.disk_used.fetch_add(size, Ordering::SeqCst);
    }

    pub(crate) fn release_disk(&self, size: u64) {
        self.disk_used.fetch_sub(size, Ordering::SeqCst);
    }
}

/// An owned memory grant. The lifetime of this object is the grant;
/// dropping it returns the quota, never manual bookkeeping at call sites.
pub struct MemoryAllocation {
    size: u64,
    accounting: Arc<QuotaAccounting>,
}

impl MemoryAllocation {
    pub(crate) fn new(size: u64, accounting: Arc<QuotaAccounting>) -> Self {
        accounting.add_memory(size);
        Self { size, accounting }
    }
}

impl Drop for MemoryAllocation {
    fn drop(&mut self) {
        self.accounting.release_memory(self.size);
    }
}

impl std::fmt::Debug for MemoryAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocation")
            .field("size", &self.size)
            .finish()
    }
}

pub(crate) enum MemoryReservation {
    Granted,
    Queued(u64),
    Refused,
}

struct PendingMemoryRequest {
    id: u64,
    blob: Uuid,
    size: u64,
    items: Vec<Arc<ShareableItem>>,
}

/// One in-flight transport-file creation task. Carried into the background
/// task and handed back on completion.
pub(crate) struct FileQuotaTask {
    pub task_id: u64,
    pub generation: u64,
    pub blob: Uuid,
    pub total: u64,
    /// One transport file per entry: path, file size, and the items that
    /// share it.
    pub files: Vec<(PathBuf, u64, Vec<Arc<ShareableItem>>)>,
}

pub(crate) struct MemoryController {
    limits: StorageLimits,
    accounting: Arc<QuotaAccounting>,
    pending: VecDeque<PendingMemoryRequest>,
    /// Sum of queued request sizes, part of the eviction trigger.
    pending_memory_bytes: u64,
    next_request_id: u64,
    pub(crate) lru: LruTracker,
    /// Only one eviction batch runs at a time.
    pub(crate) pending_evictions: bool,
    file_paging_enabled: bool,
    /// Bumped by `disable_file_paging`; stale completions are discarded.
    file_generation: u64,
    next_file_id: u64,
    next_task_id: u64,
    in_flight_file_tasks: HashMap<u64, (Uuid, u64)>,
}

impl MemoryController {
    pub fn new(limits: StorageLimits) -> Self {
        let file_paging_enabled = limits.file_paging_enabled;
        Self {
            limits,
            accounting: Arc::new(QuotaAccounting::default()),
            pending: VecDeque::new(),
            pending_memory_bytes: 0,
            next_request_id: 1,
            lru: LruTracker::default(),
            pending_evictions: false,
            file_paging_enabled,
            file_generation: 0,
            next_file_id: 1,
            next_task_id: 1,
            in_flight_file_tasks: HashMap::new(),
        }
    }

    pub fn limits(&self) -> &StorageLimits {
        &self.limits
    }

    pub fn accounting(&self) -> Arc<QuotaAccounting> {
        self.accounting.clone()
    }

    pub fn memory_usage(&self) -> u64 {
        self.accounting.memory_used()
    }

    pub fn disk_usage(&self) -> u64 {
        self.accounting.disk_used()
    }

    pub fn file_paging_enabled(&self) -> bool {
        self.file_paging_enabled
    }

    fn can_fit_ever(&self, total: u64) -> bool {
        let capacity = if self.file_paging_enabled {
            self.limits
                .max_blob_memory_space
                .saturating_add(self.limits.effective_max_disk_space)
        } else {
            self.limits.max_blob_memory_space
        };
        total <= capacity
    }

    /// Pure strategy decision: no mutation, only current usage and the
    /// static limits.
    pub fn strategy(&self, preemptive: u64, total: u64) -> TransportStrategy {
        if total == 0 {
            return TransportStrategy::NoneNeeded;
        }
        if !self.can_fit_ever(total) {
            return TransportStrategy::TooLarge;
        }
        if preemptive == total && total <= self.limits.max_blob_memory_space {
            return TransportStrategy::NoneNeeded;
        }
        if self.file_paging_enabled && total > self.limits.memory_limit_before_paging() {
            return TransportStrategy::File;
        }
        if total > self.limits.max_ipc_memory_size {
            return TransportStrategy::SharedMemory;
        }
        TransportStrategy::Ipc
    }

    /// Requests `size` bytes of memory quota for `items`. Grants
    /// synchronously only when nothing is queued ahead (FIFO fairness),
    /// otherwise queues with a cancellable request id.
    pub fn reserve_memory(
        &mut self,
        blob: Uuid,
        items: Vec<Arc<ShareableItem>>,
        size: u64,
    ) -> MemoryReservation {
        if !self.can_fit_ever(size) {
            return MemoryReservation::Refused;
        }
        if self.pending.is_empty()
            && self.accounting.memory_used().saturating_add(size)
                <= self.limits.max_blob_memory_space
        {
            self.grant_items(&items);
            return MemoryReservation::Granted;
        }
        for item in &items {
            item.lock().state = ItemState::QuotaRequested;
        }
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_memory_bytes = self.pending_memory_bytes.saturating_add(size);
        self.pending.push_back(PendingMemoryRequest {
            id,
            blob,
            size,
            items,
        });
        tracing::debug!(%blob, size, request = id, "memory quota queued");
        MemoryReservation::Queued(id)
    }

    /// Removes a queued request. A no-op when the request was already
    /// granted or never existed.
    pub fn cancel_memory_request(&mut self, id: u64) {
        let Some(pos) = self.pending.iter().position(|req| req.id == id) else {
            return;
        };
        let req = self.pending.remove(pos).unwrap();
        self.pending_memory_bytes = self.pending_memory_bytes.saturating_sub(req.size);
        for item in &req.items {
            item.lock().state = ItemState::QuotaNeeded;
        }
    }

    /// Grants queued requests strictly in FIFO order while they fit.
    /// Returns the blobs whose requests were granted.
    pub fn grant_ready(&mut self) -> Vec<Uuid> {
        let mut granted = Vec::new();
        while let Some(front) = self.pending.front() {
            let fits = self.accounting.memory_used().saturating_add(front.size)
                <= self.limits.max_blob_memory_space;
            if !fits {
                break;
            }
            let req = self.pending.pop_front().unwrap();
            self.pending_memory_bytes = self.pending_memory_bytes.saturating_sub(req.size);
            self.grant_items(&req.items);
            granted.push(req.blob);
        }
        granted
    }

    fn grant_items(&self, items: &[Arc<ShareableItem>]) {
        for item in items {
            let mut inner = item.lock();
            let len = inner.element.len();
            inner.allocation = Some(MemoryAllocation::new(len, self.accounting.clone()));
            match &mut inner.element {
                DataElement::Bytes(_) => {
                    // Data was supplied up front; the grant completes it.
                    inner.state = ItemState::PopulatedWithQuota;
                }
                DataElement::BytesPending { len, buf, .. } => {
                    if buf.is_none() {
                        *buf = Some(vec![0; *len as usize]);
                    }
                    inner.state = ItemState::QuotaGranted;
                }
                other => {
                    debug_assert!(false, "memory grant for non-memory element: {:?}", other);
                }
            }
        }
    }

    /// Eviction is worthwhile when queued demand plus current usage is
    /// past the paging mark.
    pub fn needs_eviction(&self) -> bool {
        self.file_paging_enabled
            && !self.pending_evictions
            && self
                .accounting
                .memory_used()
                .saturating_add(self.pending_memory_bytes)
                > self.limits.memory_limit_before_paging()
    }

    /// Marks items most-recently-used so they are evicted last.
    pub fn note_items_used(&mut self, items: &[Arc<ShareableItem>]) {
        for item in items {
            let inner = item.lock();
            let track = inner.state == ItemState::PopulatedWithQuota
                && inner.element.is_memory_backed();
            drop(inner);
            if track {
                self.lru.touch(item);
            }
        }
    }

    pub fn forget_item(&mut self, id: crate::item::ItemId) {
        self.lru.remove(id);
    }

    pub(crate) fn next_page_file_path(&mut self) -> PathBuf {
        let id = self.next_file_id;
        self.next_file_id += 1;
        self.limits
            .storage_dir
            .join(format!("blob_page_{:06}.bin", id))
    }

    /// Starts transport-file creation: one file per group, sized to the
    /// furthest extent of the items sharing it. Charges disk usage
    /// optimistically and hands back the task for the background runner.
    /// `None` means file transport is impossible (paging disabled or the
    /// disk budget cannot hold the request).
    pub fn begin_file_quota(
        &mut self,
        blob: Uuid,
        groups: &[Vec<Arc<ShareableItem>>],
    ) -> Option<FileQuotaTask> {
        if !self.file_paging_enabled {
            return None;
        }
        let mut total = 0u64;
        let mut files = Vec::with_capacity(groups.len());
        for group in groups {
            let mut size = 0u64;
            for item in group {
                let inner = item.lock();
                let extent = match &inner.element {
                    DataElement::File { offset, len, .. } => offset.checked_add(*len)?,
                    other => other.len(),
                };
                size = size.max(extent);
            }
            total = total.checked_add(size)?;
            files.push((self.next_page_file_path(), size, group.clone()));
        }
        if self.accounting.disk_used().saturating_add(total)
            > self.limits.effective_max_disk_space
        {
            return None;
        }
        self.accounting.add_disk(total);
        for group in groups {
            for item in group {
                item.lock().state = ItemState::QuotaRequested;
            }
        }
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.in_flight_file_tasks.insert(task_id, (blob, total));
        Some(FileQuotaTask {
            task_id,
            generation: self.file_generation,
            blob,
            total,
            files,
        })
    }

    /// Retires an in-flight file task. Returns false for stale tasks that
    /// were already cancelled by `disable_file_paging`.
    pub fn finish_file_quota(&mut self, task: &FileQuotaTask) -> bool {
        if task.generation != self.file_generation {
            return false;
        }
        self.in_flight_file_tasks.remove(&task.task_id);
        true
    }

    /// Global, irreversible failure mode: no further disk-backed
    /// reservations, every in-flight file task and queued memory request
    /// is cancelled, paging bookkeeping is cleared. Returns the blobs
    /// whose quota tasks were killed.
    pub fn disable_file_paging(&mut self) -> Vec<Uuid> {
        self.file_paging_enabled = false;
        self.file_generation += 1;
        self.lru.clear();

        let mut cancelled: Vec<Uuid> = Vec::new();
        for (_, (blob, total)) in self.in_flight_file_tasks.drain() {
            self.accounting.release_disk(total);
            cancelled.push(blob);
        }
        for req in self.pending.drain(..) {
            for item in &req.items {
                item.lock().state = ItemState::QuotaNeeded;
            }
            cancelled.push(req.blob);
        }
        self.pending_memory_bytes = 0;
        tracing::warn!(blobs = cancelled.len(), "file paging disabled");
        cancelled
    }
}
