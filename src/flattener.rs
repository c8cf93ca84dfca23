//! Pure flattening algorithm: expand a builder's raw item list into
//! resolved shareable items, expanding blob references one level via the
//! slicer and classifying which bytes need quota. Never touches the quota
//! subsystem.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::builder::BuilderItem;
use crate::entry::{BlobError, ItemCopy};
use crate::item::{DataElement, FileHandle, ItemState, ShareableItem, UNKNOWN_SIZE};
use crate::registry::Registry;
use crate::slicer;

#[derive(Debug)]
pub(crate) struct FlattenResult {
    pub items: Vec<Arc<ShareableItem>>,
    pub total_size: u64,
    pub total_memory_size: u64,
    /// Bytes that must hold memory quota before population.
    pub memory_quota_needed: u64,
    /// Bytes that must hold disk quota for file-based transport.
    pub file_quota_needed: u64,
    /// Bytes the caller already supplied in the builder.
    pub preemptive_bytes: u64,
    /// Items that need a memory grant, in item order.
    pub memory_items: Vec<Arc<ShareableItem>>,
    /// Items awaiting external population, in builder future order.
    pub transport_items: Vec<Arc<ShareableItem>>,
    /// One entry per future-data slot in builder order, populated or not,
    /// so population indices keep matching what the builder handed out.
    pub data_slots: Vec<Arc<ShareableItem>>,
    /// Future-file items grouped by caller-assigned file id; each group
    /// shares one transport file.
    pub file_groups: Vec<(u64, Vec<Arc<ShareableItem>>)>,
    pub copies: Vec<ItemCopy>,
    /// Distinct referenced blobs, each recorded once.
    pub dependencies: Vec<Uuid>,
    /// How many dependencies are themselves still building.
    pub pending_dependencies: usize,
}

impl FlattenResult {
    pub fn needs_quota(&self) -> bool {
        self.memory_quota_needed > 0 || self.file_quota_needed > 0
    }
}

fn add(a: u64, b: u64) -> Result<u64, BlobError> {
    a.checked_add(b).ok_or(BlobError::InvalidConstructionArguments)
}

pub(crate) fn flatten(
    uuid: Uuid,
    builder_items: Vec<BuilderItem>,
    registry: &Registry,
) -> Result<FlattenResult, BlobError> {
    let mut result = FlattenResult {
        items: Vec::new(),
        total_size: 0,
        total_memory_size: 0,
        memory_quota_needed: 0,
        file_quota_needed: 0,
        preemptive_bytes: 0,
        memory_items: Vec::new(),
        transport_items: Vec::new(),
        data_slots: Vec::new(),
        file_groups: Vec::new(),
        copies: Vec::new(),
        dependencies: Vec::new(),
        pending_dependencies: 0,
    };
    let mut seen_deps: HashSet<Uuid> = HashSet::new();

    // At most one item may have unknown ("until EOF") length, and only if
    // it is the sole item.
    let unknown_count = builder_items
        .iter()
        .filter(|item| match item {
            BuilderItem::File { len, .. }
            | BuilderItem::FileSystemUrl { len, .. }
            | BuilderItem::DiskCacheEntry { len, .. } => *len == UNKNOWN_SIZE,
            _ => false,
        })
        .count();
    if unknown_count > 1 || (unknown_count == 1 && builder_items.len() > 1) {
        return Err(BlobError::InvalidConstructionArguments);
    }

    for builder_item in builder_items {
        match builder_item {
            BuilderItem::Bytes(data) => {
                let len = data.len() as u64;
                let item = ShareableItem::new(
                    DataElement::Bytes(Arc::new(data)),
                    ItemState::QuotaNeeded,
                );
                result.total_size = add(result.total_size, len)?;
                result.total_memory_size = add(result.total_memory_size, len)?;
                result.memory_quota_needed = add(result.memory_quota_needed, len)?;
                result.preemptive_bytes = add(result.preemptive_bytes, len)?;
                result.memory_items.push(item.clone());
                result.items.push(item);
            }
            BuilderItem::FutureBytes { len, buf, written } => {
                let populated = written.covers(len) && buf.is_some();
                result.total_size = add(result.total_size, len)?;
                result.total_memory_size = add(result.total_memory_size, len)?;
                result.memory_quota_needed = add(result.memory_quota_needed, len)?;
                let item = if populated {
                    result.preemptive_bytes = add(result.preemptive_bytes, len)?;
                    ShareableItem::new(
                        DataElement::Bytes(Arc::new(buf.unwrap_or_default())),
                        ItemState::QuotaNeeded,
                    )
                } else {
                    let item = ShareableItem::new(
                        DataElement::BytesPending { len, buf, written },
                        ItemState::QuotaNeeded,
                    );
                    result.transport_items.push(item.clone());
                    item
                };
                result.data_slots.push(item.clone());
                result.memory_items.push(item.clone());
                result.items.push(item);
            }
            BuilderItem::FutureFile {
                offset,
                len,
                file_id,
            } => {
                let item = ShareableItem::new(
                    DataElement::File {
                        file: FileHandle::Pending,
                        offset,
                        len,
                        mtime: None,
                    },
                    ItemState::QuotaNeeded,
                );
                result.total_size = add(result.total_size, len)?;
                result.file_quota_needed = add(result.file_quota_needed, len)?;
                match result
                    .file_groups
                    .iter_mut()
                    .find(|(id, _)| *id == file_id)
                {
                    Some((_, group)) => group.push(item.clone()),
                    None => result.file_groups.push((file_id, vec![item.clone()])),
                }
                result.transport_items.push(item.clone());
                result.items.push(item);
            }
            BuilderItem::File {
                path,
                offset,
                len,
                mtime,
            } => {
                if len != UNKNOWN_SIZE {
                    result.total_size = add(result.total_size, len)?;
                } else {
                    result.total_size = UNKNOWN_SIZE;
                }
                result.items.push(ShareableItem::new(
                    DataElement::File {
                        file: FileHandle::Unowned(path),
                        offset,
                        len,
                        mtime,
                    },
                    ItemState::PopulatedWithoutQuota,
                ));
            }
            BuilderItem::FileSystemUrl {
                url,
                offset,
                len,
                mtime,
            } => {
                if len != UNKNOWN_SIZE {
                    result.total_size = add(result.total_size, len)?;
                } else {
                    result.total_size = UNKNOWN_SIZE;
                }
                result.items.push(ShareableItem::new(
                    DataElement::FileSystemUrl {
                        url,
                        offset,
                        len,
                        mtime,
                    },
                    ItemState::PopulatedWithoutQuota,
                ));
            }
            BuilderItem::DiskCacheEntry {
                handle,
                stream,
                side_stream,
                offset,
                len,
            } => {
                if len != UNKNOWN_SIZE {
                    result.total_size = add(result.total_size, len)?;
                } else {
                    result.total_size = UNKNOWN_SIZE;
                }
                result.items.push(ShareableItem::new(
                    DataElement::DiskCacheEntry {
                        handle,
                        stream,
                        side_stream,
                        offset,
                        len,
                    },
                    ItemState::PopulatedWithoutQuota,
                ));
            }
            BuilderItem::Blob {
                uuid: target_uuid,
                offset,
                len,
            } => {
                // Self-reference cannot resolve and would create a cycle.
                if target_uuid == uuid {
                    return Err(BlobError::InvalidConstructionArguments);
                }
                let target = registry
                    .get(&target_uuid)
                    .ok_or(BlobError::InvalidConstructionArguments)?;
                if target.status().is_broken() {
                    return Err(BlobError::ReferencedBlobBroken);
                }
                let target_total = target.total_size();
                let len = if len == UNKNOWN_SIZE {
                    // Length must be resolvable before quota can be
                    // computed.
                    if target_total == UNKNOWN_SIZE {
                        return Err(BlobError::InvalidConstructionArguments);
                    }
                    target_total
                        .checked_sub(offset)
                        .ok_or(BlobError::InvalidConstructionArguments)?
                } else {
                    len
                };

                if offset == 0 && len == target_total {
                    // Full extent: reuse items wholesale, no slicer call.
                    for item in target.items() {
                        if item.lock().element.is_memory_backed() {
                            result.total_memory_size =
                                add(result.total_memory_size, item.len())?;
                        }
                        result.items.push(item.clone());
                    }
                } else {
                    let sliced = slicer::slice(target, offset, len)?;
                    result.memory_quota_needed =
                        add(result.memory_quota_needed, sliced.copying_memory_size)?;
                    result.total_memory_size =
                        add(result.total_memory_size, sliced.total_memory_size)?;
                    for copy in &sliced.copies {
                        result.memory_items.push(copy.dest.clone());
                    }
                    result.copies.extend(sliced.copies);
                    result.items.extend(sliced.items);
                }
                result.total_size = add(result.total_size, len)?;

                if seen_deps.insert(target_uuid) {
                    result.dependencies.push(target_uuid);
                    if target.status().is_pending() {
                        result.pending_dependencies += 1;
                    }
                }
            }
        }
    }

    Ok(result)
}
