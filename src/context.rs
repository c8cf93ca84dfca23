//! Blob storage context: drives the end-to-end build pipeline, wires
//! flattener output into memory-controller requests, tracks cross-blob
//! dependencies, and finalizes or cancels entries.
//!
//! All registry, entry and controller mutation happens under one core
//! lock, which stands in for the single owning thread of the original
//! design. The only concurrency is task offload: page-file writes and
//! transport-file creation run on the tokio runtime and re-enter through
//! the shared core handle. Callbacks always run after the lock is
//! released, so they are free to call back into the store.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use url::Url;
use uuid::Uuid;

use crate::builder::BlobDataBuilder;
use crate::config::StorageLimits;
use crate::controller::eviction::{self, EvictionBatch};
use crate::controller::{
    FileQuotaTask, MemoryController, MemoryReservation, TransportStrategy,
};
use crate::entry::{BlobEntry, BlobError, BlobSnapshot, BlobStatus, BuildingState, ItemCopy};
use crate::error::{Error, Result};
use crate::flattener;
use crate::item::{DataElement, FileHandle, ItemState, PageFileRef, ShareableItem};
use crate::registry::Registry;

pub type CompletionCallback = Box<dyn FnOnce(BlobStatus) + Send>;
pub type TransportCallback = Box<dyn FnOnce(TransportRequest) + Send>;

/// Handed to the transport collaborator once quota is granted. Describes
/// what to populate and how the bytes should travel.
#[derive(Debug)]
pub struct TransportRequest {
    pub uuid: Uuid,
    pub strategy: TransportStrategy,
    pub items: Vec<TransportItemInfo>,
}

#[derive(Debug)]
pub struct TransportItemInfo {
    /// Population index for `populate_future_data` /
    /// `populate_future_file`. Bytes slots carry the index the builder
    /// handed out; file slots are numbered in request order.
    pub index: usize,
    pub len: u64,
    /// Per-item transport decision; small items can ride inline even when
    /// the request as a whole needs shared memory.
    pub strategy: TransportStrategy,
    pub kind: TransportItemKind,
}

#[derive(Debug)]
pub enum TransportItemKind {
    Bytes,
    File { path: PathBuf },
}

/// Work collected under the core lock and performed after it is released:
/// user callbacks plus background I/O to spawn.
#[derive(Default)]
struct Effects {
    completions: Vec<(CompletionCallback, BlobStatus)>,
    transports: Vec<(TransportCallback, TransportRequest)>,
    eviction: Option<EvictionBatch>,
    file_tasks: Vec<FileQuotaTask>,
}

struct Core {
    registry: Registry,
    controller: MemoryController,
}

/// The orchestrator. Cheap to clone; all clones share one core.
///
/// Requires a tokio runtime: paging and transport-file creation are
/// offloaded to background tasks.
#[derive(Clone)]
pub struct BlobStorage {
    core: Arc<Mutex<Core>>,
}

/// Refcounted reference to a blob entry. Cloning increments the entry's
/// refcount; dropping the last handle (and revoking the last URL) deletes
/// the entry, cancelling it first if it is still building.
pub struct BlobHandle {
    uuid: Uuid,
    core: Arc<Mutex<Core>>,
}

impl BlobHandle {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Clone for BlobHandle {
    fn clone(&self) -> Self {
        let mut core = self.core.lock().unwrap();
        if let Some(entry) = core.registry.get_mut(&self.uuid) {
            entry.refcount += 1;
        }
        drop(core);
        Self {
            uuid: self.uuid,
            core: self.core.clone(),
        }
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock().unwrap();
            core.decrement_refcount(self.uuid, &mut fx);
        }
        apply_effects(&self.core, fx);
    }
}

impl std::fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobHandle").field("uuid", &self.uuid).finish()
    }
}

impl BlobStorage {
    pub fn new(limits: StorageLimits) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                registry: Registry::default(),
                controller: MemoryController::new(limits),
            })),
        }
    }

    /// Registers a blob whose data is fully present in the builder. The
    /// returned handle is usable immediately; consult `blob_status` or a
    /// completion callback for the outcome.
    pub fn add_finished_blob(&self, builder: BlobDataBuilder) -> Result<BlobHandle> {
        if !builder.is_fully_populated() {
            let uuid = builder.uuid();
            let (_, content_type, content_disposition, _) = builder.into_parts();
            let mut core = self.core.lock().unwrap();
            if core.registry.contains(&uuid) {
                return Err(Error::BlobExists(uuid));
            }
            let mut entry = BlobEntry::new(uuid, content_type, content_disposition);
            entry.status = BlobStatus::Broken(BlobError::InvalidConstructionArguments);
            core.registry.insert(entry);
            drop(core);
            return Ok(BlobHandle {
                uuid,
                core: self.core.clone(),
            });
        }
        self.build_blob(builder, None)
    }

    /// Starts the asynchronous build pipeline. `transport` is invoked once
    /// quota is granted and external population may begin. Always returns
    /// a usable handle; failures surface through the status.
    pub fn build_blob(
        &self,
        builder: BlobDataBuilder,
        transport: Option<TransportCallback>,
    ) -> Result<BlobHandle> {
        let mut core = self.core.lock().unwrap();
        let mut fx = Effects::default();
        let result = core.build_blob(builder, transport, &mut fx);
        drop(core);
        apply_effects(&self.core, fx);
        let uuid = result?;
        Ok(BlobHandle {
            uuid,
            core: self.core.clone(),
        })
    }

    /// Cancels a building blob with the given terminal reason. Waiters and
    /// completion callbacks are still notified.
    pub fn cancel_building_blob(&self, uuid: Uuid, reason: BlobError) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if !core.registry.contains(&uuid) {
            return Err(Error::UnknownBlob(uuid));
        }
        let mut fx = Effects::default();
        core.cancel_internal(uuid, reason, &mut fx);
        drop(core);
        apply_effects(&self.core, fx);
        Ok(())
    }

    /// Copies `data` into transport bytes slot `index` at `offset`.
    pub fn populate_future_data(
        &self,
        uuid: Uuid,
        index: usize,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        let core = self.core.lock().unwrap();
        core.populate_future_data(uuid, index, data, offset)
    }

    /// Marks transport file slot `index` as written by the collaborator.
    pub fn populate_future_file(
        &self,
        uuid: Uuid,
        index: usize,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let core = self.core.lock().unwrap();
        core.populate_future_file(uuid, index, mtime)
    }

    /// The transport collaborator asserts every transport item is now
    /// populated. A malformed response breaks the blob instead of erroring.
    pub fn notify_transport_complete(&self, uuid: Uuid) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let mut fx = Effects::default();
        let result = core.notify_transport_complete(uuid, &mut fx);
        drop(core);
        apply_effects(&self.core, fx);
        result
    }

    pub fn blob_status(&self, uuid: Uuid) -> Option<BlobStatus> {
        self.core.lock().unwrap().registry.get(&uuid).map(|e| e.status())
    }

    /// Runs `callback` with the terminal status, now if the blob is
    /// already terminal, otherwise exactly once when it becomes so.
    pub fn on_construction_complete(
        &self,
        uuid: Uuid,
        callback: impl FnOnce(BlobStatus) + Send + 'static,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let mut fx = Effects::default();
        let result = core.on_construction_complete(uuid, Box::new(callback), &mut fx);
        drop(core);
        apply_effects(&self.core, fx);
        result
    }

    /// Maps a public URL onto a blob, holding a reference for as long as
    /// the mapping exists. Returns false if the URL is taken or the uuid
    /// is unknown.
    pub fn register_public_url(&self, url: Url, uuid: Uuid) -> bool {
        let mut core = self.core.lock().unwrap();
        if !core.registry.register_url(url, uuid) {
            return false;
        }
        if let Some(entry) = core.registry.get_mut(&uuid) {
            entry.refcount += 1;
        }
        true
    }

    pub fn revoke_public_url(&self, url: &Url) {
        let mut core = self.core.lock().unwrap();
        let mut fx = Effects::default();
        if let Some(uuid) = core.registry.revoke_url(url) {
            core.decrement_refcount(uuid, &mut fx);
        }
        drop(core);
        apply_effects(&self.core, fx);
    }

    pub fn blob_from_url(&self, url: &Url) -> Option<BlobHandle> {
        let mut core = self.core.lock().unwrap();
        let uuid = core.registry.uuid_from_url(url)?;
        core.registry.get_mut(&uuid)?.refcount += 1;
        drop(core);
        Some(BlobHandle {
            uuid,
            core: self.core.clone(),
        })
    }

    /// Read-only view of a finished blob; `None` until `Done`. Touches the
    /// LRU so a snapshotted blob's data is evicted last.
    pub fn snapshot(&self, uuid: Uuid) -> Option<BlobSnapshot> {
        self.core.lock().unwrap().snapshot(uuid)
    }

    pub fn memory_usage(&self) -> u64 {
        self.core.lock().unwrap().controller.memory_usage()
    }

    pub fn disk_usage(&self) -> u64 {
        self.core.lock().unwrap().controller.disk_usage()
    }

    pub fn blob_count(&self) -> usize {
        self.core.lock().unwrap().registry.len()
    }

    /// False once paging has been disabled by an I/O failure. Never
    /// becomes true again for the lifetime of the store.
    pub fn file_paging_enabled(&self) -> bool {
        self.core.lock().unwrap().controller.file_paging_enabled()
    }

    pub fn limits(&self) -> StorageLimits {
        self.core.lock().unwrap().controller.limits().clone()
    }
}

impl Core {
    fn build_blob(
        &mut self,
        builder: BlobDataBuilder,
        transport: Option<TransportCallback>,
        fx: &mut Effects,
    ) -> Result<Uuid> {
        let (uuid, content_type, content_disposition, builder_items) = builder.into_parts();
        if self.registry.contains(&uuid) {
            return Err(Error::BlobExists(uuid));
        }

        let entry = BlobEntry::new(uuid, content_type, content_disposition);
        let flat = match flattener::flatten(uuid, builder_items, &self.registry) {
            Ok(flat) => flat,
            Err(reason) => {
                // Synchronous failure: no quota was requested, nothing to
                // clean up.
                let mut entry = entry;
                entry.status = BlobStatus::Broken(reason);
                self.registry.insert(entry);
                return Ok(uuid);
            }
        };
        self.registry.insert(entry);

        for item in &flat.items {
            item.add_ref(uuid);
        }
        // Pin copy sources so eviction cannot page them out before the
        // finalization copies run.
        for copy in &flat.copies {
            copy.source.add_ref(uuid);
        }
        for dep in &flat.dependencies {
            if let Some(dep_entry) = self.registry.get_mut(dep) {
                dep_entry.refcount += 1;
                if let Some(dep_building) = dep_entry.building.as_mut() {
                    dep_building.waiters.push(uuid);
                }
            }
        }

        let transport_total = flat
            .memory_quota_needed
            .saturating_add(flat.file_quota_needed);
        let strategy = self
            .controller
            .strategy(flat.preemptive_bytes, transport_total);

        let mut memory_quota_needed = flat.memory_quota_needed;
        let mut memory_items = flat.memory_items;
        let mut file_groups: Vec<Vec<Arc<ShareableItem>>> = flat
            .file_groups
            .into_iter()
            .map(|(_, group)| group)
            .collect();
        if strategy == TransportStrategy::File {
            // Pending bytes past the paging mark travel through transport
            // files instead of memory; each converted slot gets a file of
            // its own.
            for item in &flat.transport_items {
                let mut inner = item.lock();
                let len = match &inner.element {
                    DataElement::BytesPending { len, .. } => *len,
                    _ => continue,
                };
                inner.element = DataElement::File {
                    file: FileHandle::Pending,
                    offset: 0,
                    len,
                    mtime: None,
                };
                drop(inner);
                memory_quota_needed = memory_quota_needed.saturating_sub(len);
                file_groups.push(vec![item.clone()]);
            }
            memory_items.retain(|item| item.lock().element.is_memory_backed());
        }

        {
            let entry = self
                .registry
                .get_mut(&uuid)
                .expect("entry was just inserted");
            entry.set_items(flat.items, flat.total_size);
            entry.status = BlobStatus::PendingQuota;
            entry.building = Some(BuildingState {
                transport_items: flat.transport_items.clone(),
                data_slots: flat.data_slots,
                copies: flat.copies,
                dependencies: flat.dependencies,
                pending_dependent_count: flat.pending_dependencies,
                waiters: Vec::new(),
                memory_request: None,
                pending_quota_ops: 0,
                strategy,
                transport_callback: transport,
                completion_callbacks: Vec::new(),
            });
        }

        if strategy == TransportStrategy::TooLarge {
            self.cancel_internal(uuid, BlobError::OutOfMemory, fx);
            return Ok(uuid);
        }

        if !file_groups.is_empty() {
            match self.controller.begin_file_quota(uuid, &file_groups) {
                Some(task) => {
                    if let Some(building) = self.building_mut(&uuid) {
                        building.pending_quota_ops += 1;
                    }
                    fx.file_tasks.push(task);
                }
                None => {
                    self.cancel_internal(uuid, BlobError::OutOfMemory, fx);
                    return Ok(uuid);
                }
            }
        }

        // Preemptive bytes alone can exceed the memory budget; no grant
        // will ever cover them.
        if memory_quota_needed > self.controller.limits().max_blob_memory_space {
            self.cancel_internal(uuid, BlobError::OutOfMemory, fx);
            return Ok(uuid);
        }

        if memory_quota_needed > 0 {
            match self
                .controller
                .reserve_memory(uuid, memory_items, memory_quota_needed)
            {
                MemoryReservation::Granted => {}
                MemoryReservation::Queued(id) => {
                    if let Some(building) = self.building_mut(&uuid) {
                        building.memory_request = Some(id);
                        building.pending_quota_ops += 1;
                    }
                }
                MemoryReservation::Refused => {
                    self.cancel_internal(uuid, BlobError::OutOfMemory, fx);
                    return Ok(uuid);
                }
            }
        }

        let outstanding = self
            .registry
            .get(&uuid)
            .and_then(|e| e.building.as_ref())
            .map(|b| b.pending_quota_ops)
            .unwrap_or(1);
        if outstanding == 0 {
            self.advance_past_quota(uuid, fx);
        }

        if fx.eviction.is_none() {
            fx.eviction = eviction::select_batch(&mut self.controller, &self.registry);
        }
        Ok(uuid)
    }

    fn building_mut(&mut self, uuid: &Uuid) -> Option<&mut BuildingState> {
        self.registry.get_mut(uuid).and_then(|e| e.building.as_mut())
    }

    /// Quota is fully held; either hand off to the transport collaborator
    /// or move straight to waiting on dependencies.
    fn advance_past_quota(&mut self, uuid: Uuid, fx: &mut Effects) {
        enum Next {
            Transport(Option<(TransportCallback, TransportRequest)>),
            Internals,
        }
        let next = {
            let Some(entry) = self.registry.get_mut(&uuid) else {
                return;
            };
            let Some(building) = entry.building.as_mut() else {
                return;
            };
            let unpopulated = building.transport_items.iter().any(|item| {
                !matches!(
                    item.state(),
                    ItemState::PopulatedWithQuota | ItemState::PopulatedWithoutQuota
                )
            });
            if unpopulated {
                entry.status = BlobStatus::PendingTransport;
                let request =
                    build_transport_request(uuid, building, &self.controller);
                Next::Transport(
                    building
                        .transport_callback
                        .take()
                        .map(|callback| (callback, request)),
                )
            } else {
                entry.status = BlobStatus::PendingInternals;
                Next::Internals
            }
        };
        match next {
            Next::Transport(Some((callback, request))) => fx.transports.push((callback, request)),
            Next::Transport(None) => {}
            Next::Internals => self.try_finish(uuid, fx),
        }
    }

    fn try_finish(&mut self, uuid: Uuid, fx: &mut Effects) {
        let ready = self
            .registry
            .get(&uuid)
            .map(|e| {
                e.status() == BlobStatus::PendingInternals
                    && e.building
                        .as_ref()
                        .map(|b| b.pending_dependent_count == 0)
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if ready {
            self.finish_building(uuid, fx);
        }
    }

    fn finish_building(&mut self, uuid: Uuid, fx: &mut Effects) {
        let copies_ok = self
            .registry
            .get(&uuid)
            .and_then(|e| e.building.as_ref())
            .map(|b| execute_copies(&b.copies))
            .unwrap_or(true);
        if !copies_ok {
            self.cancel_internal(uuid, BlobError::InvalidConstructionArguments, fx);
            return;
        }

        let (building, items) = {
            let Some(entry) = self.registry.get_mut(&uuid) else {
                return;
            };
            let Some(building) = entry.building.take() else {
                return;
            };
            entry.status = BlobStatus::Done;
            (building, entry.items.clone())
        };
        self.controller.note_items_used(&items);
        tracing::debug!(%uuid, items = items.len(), "blob finished");

        let item_ids: HashSet<_> = items.iter().map(|i| i.id()).collect();
        for copy in &building.copies {
            if !item_ids.contains(&copy.source.id()) && copy.source.remove_ref(&uuid) {
                self.controller.forget_item(copy.source.id());
            }
        }
        for callback in building.completion_callbacks {
            fx.completions.push((callback, BlobStatus::Done));
        }
        for dep in &building.dependencies {
            self.decrement_refcount(*dep, fx);
        }
        for waiter in building.waiters {
            self.dependency_finished(waiter, true, fx);
        }
        self.pump(fx);
    }

    fn dependency_finished(&mut self, uuid: Uuid, success: bool, fx: &mut Effects) {
        if !success {
            // Errors propagate downstream, never upstream.
            self.cancel_internal(uuid, BlobError::ReferencedBlobBroken, fx);
            return;
        }
        let Some(building) = self.building_mut(&uuid) else {
            return;
        };
        building.pending_dependent_count = building.pending_dependent_count.saturating_sub(1);
        self.try_finish(uuid, fx);
    }

    /// Idempotent: the building state is taken before anything else, so a
    /// second failure path finds nothing to cancel.
    fn cancel_internal(&mut self, uuid: Uuid, reason: BlobError, fx: &mut Effects) {
        let (building, cleared) = {
            let Some(entry) = self.registry.get_mut(&uuid) else {
                return;
            };
            let Some(building) = entry.building.take() else {
                return;
            };
            entry.status = BlobStatus::Broken(reason);
            (building, entry.clear_items())
        };
        tracing::warn!(%uuid, ?reason, "blob build cancelled");
        let BuildingState {
            transport_items,
            data_slots,
            copies,
            dependencies,
            waiters,
            memory_request,
            completion_callbacks,
            ..
        } = building;

        if let Some(request) = memory_request {
            self.controller.cancel_memory_request(request);
        }
        let cleared_ids: HashSet<_> = cleared.iter().map(|i| i.id()).collect();
        for item in &cleared {
            if item.remove_ref(&uuid) {
                self.controller.forget_item(item.id());
            }
        }
        for copy in &copies {
            if !cleared_ids.contains(&copy.source.id()) && copy.source.remove_ref(&uuid) {
                self.controller.forget_item(copy.source.id());
            }
        }
        for callback in completion_callbacks {
            fx.completions.push((callback, BlobStatus::Broken(reason)));
        }
        // The item handles must be gone before the pump below: dropping
        // the last handle releases this blob's memory grants, which the
        // queued requests are waiting on.
        drop(cleared);
        drop(copies);
        drop(transport_items);
        drop(data_slots);

        for dep in &dependencies {
            self.decrement_refcount(*dep, fx);
        }
        for waiter in waiters {
            self.cancel_internal(waiter, BlobError::ReferencedBlobBroken, fx);
        }
        self.pump(fx);
    }

    fn decrement_refcount(&mut self, uuid: Uuid, fx: &mut Effects) {
        let now_zero = {
            let Some(entry) = self.registry.get_mut(&uuid) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount == 0
        };
        if !now_zero {
            return;
        }
        let still_building = self
            .registry
            .get(&uuid)
            .map(|e| e.status().is_pending())
            .unwrap_or(false);
        if still_building {
            self.cancel_internal(uuid, BlobError::SourceDiedInTransit, fx);
        }
        if let Some(entry) = self.registry.remove(&uuid) {
            for item in entry.items() {
                if item.remove_ref(&uuid) {
                    self.controller.forget_item(item.id());
                }
            }
        }
        self.pump(fx);
    }

    /// Grants whatever now fits (FIFO), advances the granted blobs, and
    /// re-checks eviction. Runs at the end of every operation that can
    /// free or demand memory.
    fn pump(&mut self, fx: &mut Effects) {
        for blob in self.controller.grant_ready() {
            self.quota_op_complete(blob, fx);
        }
        if fx.eviction.is_none() {
            fx.eviction = eviction::select_batch(&mut self.controller, &self.registry);
        }
    }

    fn quota_op_complete(&mut self, uuid: Uuid, fx: &mut Effects) {
        let done = {
            let Some(building) = self.building_mut(&uuid) else {
                return;
            };
            building.memory_request = None;
            building.pending_quota_ops = building.pending_quota_ops.saturating_sub(1);
            building.pending_quota_ops == 0
        };
        if done {
            self.advance_past_quota(uuid, fx);
        }
    }

    fn notify_transport_complete(&mut self, uuid: Uuid, fx: &mut Effects) -> Result<()> {
        enum Verdict {
            Populated,
            Malformed,
        }
        let verdict = {
            let entry = self
                .registry
                .get_mut(&uuid)
                .ok_or(Error::UnknownBlob(uuid))?;
            if entry.status() != BlobStatus::PendingTransport {
                return Err(Error::WrongPhase(uuid, "PendingTransport"));
            }
            let building = entry.building.as_ref().expect("pending entries are building");
            let mut verdict = Verdict::Populated;
            for item in &building.transport_items {
                let mut inner = item.lock();
                let transport_done = inner.transport_done;
                enum Action {
                    ToBytes(Vec<u8>),
                    MarkFile,
                    Fail,
                }
                let action = match &mut inner.element {
                    DataElement::BytesPending { len, buf, written } => {
                        if written.covers(*len) {
                            match buf.take() {
                                Some(data) => Action::ToBytes(data),
                                None if *len == 0 => Action::ToBytes(Vec::new()),
                                None => Action::Fail,
                            }
                        } else {
                            Action::Fail
                        }
                    }
                    DataElement::Bytes(_) => {
                        // Populated before the transport phase began.
                        continue;
                    }
                    DataElement::File { .. } => {
                        if transport_done {
                            Action::MarkFile
                        } else {
                            Action::Fail
                        }
                    }
                    _ => Action::Fail,
                };
                match action {
                    Action::ToBytes(data) => {
                        inner.element = DataElement::Bytes(Arc::new(data));
                        inner.state = ItemState::PopulatedWithQuota;
                    }
                    Action::MarkFile => inner.state = ItemState::PopulatedWithoutQuota,
                    Action::Fail => {
                        verdict = Verdict::Malformed;
                        break;
                    }
                }
            }
            verdict
        };
        match verdict {
            Verdict::Malformed => {
                self.cancel_internal(uuid, BlobError::InvalidConstructionArguments, fx)
            }
            Verdict::Populated => {
                if let Some(entry) = self.registry.get_mut(&uuid) {
                    entry.status = BlobStatus::PendingInternals;
                }
                self.try_finish(uuid, fx);
            }
        }
        Ok(())
    }

    fn populate_future_data(
        &self,
        uuid: Uuid,
        index: usize,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        let entry = self.registry.get(&uuid).ok_or(Error::UnknownBlob(uuid))?;
        if entry.status() != BlobStatus::PendingTransport {
            return Err(Error::WrongPhase(uuid, "PendingTransport"));
        }
        let building = entry.building.as_ref().expect("pending entries are building");
        // Slots are addressed by the index the builder handed out, so a
        // slot populated before the build still counts.
        let item = building
            .data_slots
            .get(index)
            .ok_or_else(|| Error::InvalidPopulation(format!("no bytes slot {}", index)))?;

        let mut inner = item.lock();
        if inner.state != ItemState::QuotaGranted {
            return Err(Error::InvalidPopulation(format!(
                "bytes slot {} is not awaiting population",
                index
            )));
        }
        match &mut inner.element {
            DataElement::BytesPending { len, buf, written } => {
                let end = offset
                    .checked_add(data.len() as u64)
                    .filter(|&end| end <= *len)
                    .ok_or_else(|| {
                        Error::InvalidPopulation(format!("write past end of slot {}", index))
                    })?;
                let buf = buf.as_mut().expect("granted pending bytes have a buffer");
                buf[offset as usize..end as usize].copy_from_slice(data);
                written.insert(offset, end);
                Ok(())
            }
            _ => Err(Error::InvalidPopulation(format!(
                "slot {} is not pending bytes",
                index
            ))),
        }
    }

    fn populate_future_file(
        &self,
        uuid: Uuid,
        index: usize,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let entry = self.registry.get(&uuid).ok_or(Error::UnknownBlob(uuid))?;
        if entry.status() != BlobStatus::PendingTransport {
            return Err(Error::WrongPhase(uuid, "PendingTransport"));
        }
        let building = entry.building.as_ref().expect("pending entries are building");
        let item = building
            .transport_items
            .iter()
            .filter(|item| !item.lock().element.is_memory_backed())
            .nth(index)
            .ok_or_else(|| Error::InvalidPopulation(format!("no file slot {}", index)))?;

        let mut inner = item.lock();
        if inner.state != ItemState::QuotaGranted {
            return Err(Error::InvalidPopulation(format!(
                "file slot {} has no quota",
                index
            )));
        }
        if let DataElement::File { mtime: slot, .. } = &mut inner.element {
            *slot = mtime;
        }
        inner.transport_done = true;
        Ok(())
    }

    fn on_construction_complete(
        &mut self,
        uuid: Uuid,
        callback: CompletionCallback,
        fx: &mut Effects,
    ) -> Result<()> {
        let entry = self
            .registry
            .get_mut(&uuid)
            .ok_or(Error::UnknownBlob(uuid))?;
        match entry.building.as_mut() {
            Some(building) => building.completion_callbacks.push(callback),
            None => fx.completions.push((callback, entry.status())),
        }
        Ok(())
    }

    fn snapshot(&mut self, uuid: Uuid) -> Option<BlobSnapshot> {
        let (snapshot, items) = {
            let entry = self.registry.get(&uuid)?;
            if entry.status() != BlobStatus::Done {
                return None;
            }
            let items: Vec<_> = entry.items().to_vec();
            let elements = items.iter().map(|item| item.lock().element.clone()).collect();
            (
                BlobSnapshot {
                    uuid,
                    content_type: entry.content_type.clone(),
                    content_disposition: entry.content_disposition.clone(),
                    total_size: entry.total_size(),
                    items: elements,
                },
                items,
            )
        };
        self.controller.note_items_used(&items);
        Some(snapshot)
    }

    /// Commits or rolls back one finished eviction batch.
    fn complete_eviction(&mut self, batch: EvictionBatch, result: io::Result<()>) -> Effects {
        let mut fx = Effects::default();
        self.controller.pending_evictions = false;

        let rollback = match result {
            Err(err) => {
                tracing::error!(error = %err, path = %batch.path.display(), "page file write failed");
                for blob in self.controller.disable_file_paging() {
                    self.cancel_internal(blob, BlobError::OutOfMemory, &mut fx);
                }
                true
            }
            Ok(()) => !self.controller.file_paging_enabled(),
        };
        if rollback {
            for item in &batch.items {
                item.lock().paging_out = false;
            }
            let _ = std::fs::remove_file(&batch.path);
            return fx;
        }

        let accounting = self.controller.accounting();
        accounting.add_disk(batch.total);
        let page = PageFileRef::new(batch.path.clone(), batch.total, accounting);
        let mut offset = 0u64;
        for (item, len) in batch.items.iter().zip(batch.sizes.iter().copied()) {
            let mut inner = item.lock();
            if inner.state == ItemState::PopulatedWithQuota && inner.paging_out {
                inner.element = DataElement::File {
                    file: FileHandle::Owned(page.clone()),
                    offset,
                    len,
                    mtime: None,
                };
                inner.state = ItemState::PopulatedWithoutQuota;
                // Dropping the allocation returns the memory quota.
                inner.allocation = None;
                inner.paging_out = false;
                drop(inner);
                self.controller.forget_item(item.id());
            }
            offset += len;
        }
        tracing::debug!(
            path = %batch.path.display(),
            total = batch.total,
            "eviction batch committed"
        );
        self.pump(&mut fx);
        fx
    }

    /// Commits or rolls back one finished transport-file creation task.
    fn complete_file_quota(&mut self, task: FileQuotaTask, result: io::Result<()>) -> Effects {
        let mut fx = Effects::default();
        if !self.controller.finish_file_quota(&task) {
            // Paging was disabled while the task ran; its accounting is
            // already rolled back, only the files remain.
            for (path, _, _) in &task.files {
                let _ = std::fs::remove_file(path);
            }
            return fx;
        }
        match result {
            Err(err) => {
                tracing::error!(error = %err, "transport file creation failed");
                self.controller.accounting().release_disk(task.total);
                for (path, _, _) in &task.files {
                    let _ = std::fs::remove_file(path);
                }
                let mut cancelled = self.controller.disable_file_paging();
                cancelled.push(task.blob);
                for blob in cancelled {
                    self.cancel_internal(blob, BlobError::OutOfMemory, &mut fx);
                }
            }
            Ok(()) => {
                let accounting = self.controller.accounting();
                for (path, size, group) in &task.files {
                    let page = PageFileRef::new(path.clone(), *size, accounting.clone());
                    for item in group {
                        let mut inner = item.lock();
                        if let DataElement::File { file, .. } = &mut inner.element {
                            *file = FileHandle::Owned(page.clone());
                        }
                        inner.state = ItemState::QuotaGranted;
                    }
                }
                self.quota_op_complete(task.blob, &mut fx);
            }
        }
        fx
    }
}

/// Executes the deferred boundary copies. Sources must be populated bytes;
/// destinations must be pending placeholders holding quota.
fn execute_copies(copies: &[ItemCopy]) -> bool {
    for copy in copies {
        let data = {
            let inner = copy.source.lock();
            match &inner.element {
                DataElement::Bytes(data) => data.clone(),
                _ => return false,
            }
        };
        let mut inner = copy.dest.lock();
        let len = match &inner.element {
            DataElement::BytesPending { len, .. } => *len,
            _ => return false,
        };
        let start = copy.source_offset as usize;
        let end = start + len as usize;
        if end > data.len() {
            return false;
        }
        inner.element = DataElement::Bytes(Arc::new(data[start..end].to_vec()));
        inner.state = ItemState::PopulatedWithQuota;
    }
    true
}

fn build_transport_request(
    uuid: Uuid,
    building: &BuildingState,
    controller: &MemoryController,
) -> TransportRequest {
    let mut files_seen = 0usize;
    let items = building
        .transport_items
        .iter()
        .map(|item| {
            let inner = item.lock();
            let len = inner.element.len();
            let (index, kind) = if inner.element.is_memory_backed() {
                // Bytes slots report the builder-assigned index.
                let index = building
                    .data_slots
                    .iter()
                    .position(|slot| slot.id() == item.id())
                    .unwrap_or_default();
                (index, TransportItemKind::Bytes)
            } else {
                let index = files_seen;
                files_seen += 1;
                let path = match &inner.element {
                    DataElement::File { file, .. } => file
                        .path()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_default(),
                    _ => PathBuf::new(),
                };
                (index, TransportItemKind::File { path })
            };
            TransportItemInfo {
                index,
                len,
                strategy: controller.strategy(0, len),
                kind,
            }
        })
        .collect();
    TransportRequest {
        uuid,
        strategy: building.strategy,
        items,
    }
}

/// Runs callbacks and spawns background I/O collected under the lock.
fn apply_effects(core: &Arc<Mutex<Core>>, fx: Effects) {
    for (callback, status) in fx.completions {
        callback(status);
    }
    for (callback, request) in fx.transports {
        callback(request);
    }
    if let Some(batch) = fx.eviction {
        let core = core.clone();
        tokio::spawn(async move {
            let result = eviction::write_page_file(&batch.path, &batch.segments).await;
            let next = {
                let mut guard = core.lock().unwrap();
                guard.complete_eviction(batch, result)
            };
            apply_effects(&core, next);
        });
    }
    for task in fx.file_tasks {
        let core = core.clone();
        tokio::spawn(async move {
            let result = create_transport_files(&task).await;
            let next = {
                let mut guard = core.lock().unwrap();
                guard.complete_file_quota(task, result)
            };
            apply_effects(&core, next);
        });
    }
}

async fn create_transport_files(task: &FileQuotaTask) -> io::Result<()> {
    for (path, size, _) in &task.files {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        file.set_len(*size).await?;
        file.sync_all().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BlobError;
    use std::sync::mpsc;

    fn storage() -> BlobStorage {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = BlobStorage::new(StorageLimits::new(dir.path()));
        // The tempdir guard is dropped here; page files are only created
        // under memory pressure, which these tests never reach.
        storage
    }

    #[tokio::test]
    async fn test_finished_blob_is_done_immediately() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_data(b"hello world".to_vec());
        let handle = storage.add_finished_blob(builder).expect("add");

        assert_eq!(storage.blob_status(handle.uuid()), Some(BlobStatus::Done));
        let snapshot = storage.snapshot(handle.uuid()).expect("snapshot");
        assert_eq!(snapshot.total_size, 11);
        match &snapshot.items[0] {
            DataElement::Bytes(data) => assert_eq!(&data[..], b"hello world"),
            other => panic!("unexpected element: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpopulated_finished_blob_breaks() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_future_data(8);
        let handle = storage.add_finished_blob(builder).expect("add");
        assert_eq!(
            storage.blob_status(handle.uuid()),
            Some(BlobStatus::Broken(BlobError::InvalidConstructionArguments))
        );
    }

    #[tokio::test]
    async fn test_future_data_transport_lifecycle() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        let slot = builder.append_future_data(5);
        let (tx, rx) = mpsc::channel();
        let handle = storage
            .build_blob(
                builder,
                Some(Box::new(move |request| {
                    tx.send(request).expect("send");
                })),
            )
            .expect("build");
        let uuid = handle.uuid();

        // Quota fits, so the transport request fires during the call.
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::PendingTransport));
        let request = rx.try_recv().expect("transport request");
        assert_eq!(request.uuid, uuid);
        assert_eq!(request.items.len(), 1);
        assert_eq!(request.items[0].len, 5);
        assert_eq!(request.items[0].strategy, TransportStrategy::Ipc);

        storage
            .populate_future_data(uuid, slot, b"abcde", 0)
            .expect("populate");
        storage.notify_transport_complete(uuid).expect("notify");
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
        let snapshot = storage.snapshot(uuid).expect("snapshot");
        match &snapshot.items[0] {
            DataElement::Bytes(data) => assert_eq!(&data[..], b"abcde"),
            other => panic!("unexpected element: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_population_outside_transport_phase_errors() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_data(vec![1, 2, 3]);
        let handle = storage.add_finished_blob(builder).expect("add");
        let err = storage
            .populate_future_data(handle.uuid(), 0, b"x", 0)
            .expect_err("done blobs take no population");
        assert!(matches!(err, Error::WrongPhase(..)));
    }

    #[tokio::test]
    async fn test_dependent_blob_waits_for_source() {
        let storage = storage();
        let mut source = BlobDataBuilder::new();
        let slot = source.append_future_data(4);
        let (tx, rx) = mpsc::channel();
        let source_handle = storage
            .build_blob(
                source,
                Some(Box::new(move |request| {
                    tx.send(request).expect("send");
                })),
            )
            .expect("build source");
        let source_uuid = source_handle.uuid();
        rx.try_recv().expect("source transport request");

        let mut dependent = BlobDataBuilder::new();
        dependent.append_blob(source_uuid);
        let dependent_handle = storage.build_blob(dependent, None).expect("build dependent");
        let dependent_uuid = dependent_handle.uuid();
        assert_eq!(
            storage.blob_status(dependent_uuid),
            Some(BlobStatus::PendingInternals)
        );

        storage
            .populate_future_data(source_uuid, slot, b"data", 0)
            .expect("populate");
        storage.notify_transport_complete(source_uuid).expect("notify");
        assert_eq!(storage.blob_status(source_uuid), Some(BlobStatus::Done));
        assert_eq!(storage.blob_status(dependent_uuid), Some(BlobStatus::Done));
        assert_eq!(
            storage.snapshot(dependent_uuid).expect("snapshot").total_size,
            4
        );
    }

    #[tokio::test]
    async fn test_cancelled_source_breaks_dependents() {
        let storage = storage();
        let mut source = BlobDataBuilder::new();
        source.append_future_data(4);
        let source_handle = storage.build_blob(source, None).expect("build source");

        let mut dependent = BlobDataBuilder::new();
        dependent.append_blob(source_handle.uuid());
        let dependent_handle = storage.build_blob(dependent, None).expect("build dependent");

        storage
            .cancel_building_blob(source_handle.uuid(), BlobError::SourceDiedInTransit)
            .expect("cancel");
        assert_eq!(
            storage.blob_status(source_handle.uuid()),
            Some(BlobStatus::Broken(BlobError::SourceDiedInTransit))
        );
        assert_eq!(
            storage.blob_status(dependent_handle.uuid()),
            Some(BlobStatus::Broken(BlobError::ReferencedBlobBroken))
        );
    }

    #[tokio::test]
    async fn test_last_handle_drop_cancels_building_blob() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_future_data(4);
        let handle = storage.build_blob(builder, None).expect("build");
        let uuid = handle.uuid();

        let (tx, rx) = mpsc::channel();
        storage
            .on_construction_complete(uuid, move |status| {
                tx.send(status).expect("send");
            })
            .expect("register callback");

        drop(handle);
        assert_eq!(
            rx.try_recv().expect("completion"),
            BlobStatus::Broken(BlobError::SourceDiedInTransit)
        );
        // The entry is gone with the last reference.
        assert_eq!(storage.blob_status(uuid), None);
        assert_eq!(storage.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_public_url_holds_a_reference() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_data(vec![7; 3]);
        let handle = storage.add_finished_blob(builder).expect("add");
        let uuid = handle.uuid();

        let url: Url = "blob:test/held".parse().expect("url");
        assert!(storage.register_public_url(url.clone(), uuid));
        drop(handle);
        // Still reachable through the URL.
        let through_url = storage.blob_from_url(&url).expect("url lookup");
        assert_eq!(through_url.uuid(), uuid);
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));

        drop(through_url);
        storage.revoke_public_url(&url);
        assert_eq!(storage.blob_status(uuid), None);
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_rejected() {
        let storage = storage();
        let mut first = BlobDataBuilder::new();
        first.append_data(vec![1]);
        let handle = storage.add_finished_blob(first).expect("add");

        let mut second = BlobDataBuilder::with_uuid(handle.uuid());
        second.append_data(vec![2]);
        let err = storage.add_finished_blob(second).expect_err("duplicate");
        assert!(matches!(err, Error::BlobExists(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_quota_to_queued_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut limits = StorageLimits::new(dir.path());
        limits.max_blob_memory_space = 100;
        limits.file_paging_enabled = false;
        let storage = BlobStorage::new(limits);

        let mut first = BlobDataBuilder::new();
        first.append_future_data(80);
        let first_handle = storage.build_blob(first, None).expect("build first");
        assert_eq!(
            storage.blob_status(first_handle.uuid()),
            Some(BlobStatus::PendingTransport)
        );
        assert_eq!(storage.memory_usage(), 80);

        let mut second = BlobDataBuilder::new();
        second.append_data(vec![0; 50]);
        let second_handle = storage.add_finished_blob(second).expect("add second");
        assert_eq!(
            storage.blob_status(second_handle.uuid()),
            Some(BlobStatus::PendingQuota)
        );

        // Cancelling the first blob frees its grant; the queued request
        // must be granted in the same step.
        storage
            .cancel_building_blob(first_handle.uuid(), BlobError::SourceDiedInTransit)
            .expect("cancel");
        assert_eq!(
            storage.blob_status(second_handle.uuid()),
            Some(BlobStatus::Done)
        );
        assert_eq!(storage.memory_usage(), 50);
    }

    #[tokio::test]
    async fn test_preemptive_bytes_past_memory_budget_break() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut limits = StorageLimits::new(dir.path());
        limits.max_blob_memory_space = 500;
        limits.effective_max_disk_space = 1000;
        limits.min_page_file_size = 100;
        let storage = BlobStorage::new(limits);

        // Fits memory plus disk, but a memory grant can never cover it.
        let mut builder = BlobDataBuilder::new();
        builder.append_data(vec![0; 600]);
        let handle = storage.add_finished_blob(builder).expect("add");
        assert_eq!(
            storage.blob_status(handle.uuid()),
            Some(BlobStatus::Broken(BlobError::OutOfMemory))
        );
        assert_eq!(storage.memory_usage(), 0);
        assert_eq!(storage.disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_populate_uses_builder_slot_indices() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        let first = builder.append_future_data(3);
        let second = builder.append_future_data(4);
        assert!(builder.populate_future_data(first, b"abc", 0));

        let (tx, rx) = mpsc::channel();
        let handle = storage
            .build_blob(
                builder,
                Some(Box::new(move |request| {
                    tx.send(request).expect("send");
                })),
            )
            .expect("build");
        let uuid = handle.uuid();

        // Only the unpopulated slot needs transport, and it keeps the
        // index the builder returned.
        let request = rx.try_recv().expect("transport request");
        assert_eq!(request.items.len(), 1);
        assert_eq!(request.items[0].index, second);

        let err = storage
            .populate_future_data(uuid, first, b"xyz", 0)
            .expect_err("pre-populated slot refuses writes");
        assert!(matches!(err, Error::InvalidPopulation(_)));

        storage
            .populate_future_data(uuid, second, b"defg", 0)
            .expect("populate");
        storage.notify_transport_complete(uuid).expect("notify");
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::Done));
        let snapshot = storage.snapshot(uuid).expect("snapshot");
        assert_eq!(snapshot.total_size, 7);
        match (&snapshot.items[0], &snapshot.items[1]) {
            (DataElement::Bytes(head), DataElement::Bytes(tail)) => {
                assert_eq!(&head[..], b"abc");
                assert_eq!(&tail[..], b"defg");
            }
            other => panic!("unexpected elements: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overlapping_writes_do_not_complete_a_slot() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        let slot = builder.append_future_data(6);
        let handle = storage.build_blob(builder, None).expect("build");
        let uuid = handle.uuid();
        assert_eq!(storage.blob_status(uuid), Some(BlobStatus::PendingTransport));

        storage
            .populate_future_data(uuid, slot, b"abc", 0)
            .expect("populate");
        storage
            .populate_future_data(uuid, slot, b"xyz", 0)
            .expect("rewrite");
        // Six bytes written, half the slot still untouched.
        storage.notify_transport_complete(uuid).expect("notify");
        assert_eq!(
            storage.blob_status(uuid),
            Some(BlobStatus::Broken(BlobError::InvalidConstructionArguments))
        );
    }

    #[tokio::test]
    async fn test_completion_callback_fires_immediately_when_terminal() {
        let storage = storage();
        let mut builder = BlobDataBuilder::new();
        builder.append_data(vec![0; 2]);
        let handle = storage.add_finished_blob(builder).expect("add");

        let (tx, rx) = mpsc::channel();
        storage
            .on_construction_complete(handle.uuid(), move |status| {
                tx.send(status).expect("send");
            })
            .expect("register");
        assert_eq!(rx.try_recv().expect("completion"), BlobStatus::Done);
    }
}
