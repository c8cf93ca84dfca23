//! Pure slicing algorithm: project a byte window of a source blob onto a
//! new item list, sharing whole items and materializing placeholders only
//! at the two boundary items.

use std::sync::Arc;

use crate::entry::{BlobEntry, BlobError, ItemCopy};
use crate::item::{DataElement, ItemState, ShareableItem, WriteMap};

pub(crate) struct SliceResult {
    pub items: Vec<Arc<ShareableItem>>,
    /// Local offset into the first overlapping source item.
    pub first_item_slice_offset: u64,
    /// Deferred copies for the (at most two) partial bytes boundary items.
    pub copies: Vec<ItemCopy>,
    /// Bytes that must be copied into placeholders, i.e. new quota.
    pub copying_memory_size: u64,
    /// All memory-backed bytes in the slice, shared or copied.
    pub total_memory_size: u64,
}

/// Slices `[offset, offset + len)` out of a source entry. The source item
/// list must already be flattened: a `Blob` element here is a construction
/// error.
pub(crate) fn slice(entry: &BlobEntry, offset: u64, len: u64) -> Result<SliceResult, BlobError> {
    let end = offset
        .checked_add(len)
        .ok_or(BlobError::InvalidConstructionArguments)?;
    if end > entry.total_size() {
        return Err(BlobError::InvalidConstructionArguments);
    }

    let mut result = SliceResult {
        items: Vec::new(),
        first_item_slice_offset: 0,
        copies: Vec::new(),
        copying_memory_size: 0,
        total_memory_size: 0,
    };
    if len == 0 {
        return Ok(result);
    }

    // offsets[i] is the start offset of item i + 1, so the first
    // overlapping item is the first whose start is not past `offset`.
    let first_index = entry.offsets.partition_point(|&start| start <= offset);
    let item_start = if first_index == 0 {
        0
    } else {
        entry.offsets[first_index - 1]
    };
    let mut item_offset = offset - item_start;
    result.first_item_slice_offset = item_offset;

    let mut remaining = len;
    for item in entry.items()[first_index..].iter() {
        let item_len = item.len();
        let read_size = (item_len - item_offset).min(remaining);

        if read_size == item_len {
            // Whole-item reuse: share by reference, no copy, no new quota.
            let inner = item.lock();
            if inner.element.is_memory_backed() {
                result.total_memory_size += read_size;
            }
            drop(inner);
            result.items.push(item.clone());
        } else {
            let element = {
                let inner = item.lock();
                inner.element.clone()
            };
            match element {
                DataElement::Bytes(_) | DataElement::BytesPending { .. } => {
                    let dest = ShareableItem::new(
                        DataElement::BytesPending {
                            len: read_size,
                            buf: None,
                            written: WriteMap::default(),
                        },
                        ItemState::QuotaNeeded,
                    );
                    result.copies.push(ItemCopy {
                        source: item.clone(),
                        source_offset: item_offset,
                        dest: dest.clone(),
                    });
                    result.copying_memory_size += read_size;
                    result.total_memory_size += read_size;
                    result.items.push(dest);
                }
                DataElement::File {
                    file,
                    offset: file_offset,
                    mtime,
                    ..
                } => {
                    // Range-addressable: re-range instead of copying.
                    result.items.push(ShareableItem::new(
                        DataElement::File {
                            file,
                            offset: file_offset + item_offset,
                            len: read_size,
                            mtime,
                        },
                        ItemState::PopulatedWithoutQuota,
                    ));
                }
                DataElement::FileSystemUrl {
                    url,
                    offset: url_offset,
                    mtime,
                    ..
                } => {
                    result.items.push(ShareableItem::new(
                        DataElement::FileSystemUrl {
                            url,
                            offset: url_offset + item_offset,
                            len: read_size,
                            mtime,
                        },
                        ItemState::PopulatedWithoutQuota,
                    ));
                }
                DataElement::DiskCacheEntry {
                    handle,
                    stream,
                    side_stream,
                    offset: entry_offset,
                    ..
                } => {
                    result.items.push(ShareableItem::new(
                        DataElement::DiskCacheEntry {
                            handle,
                            stream,
                            side_stream,
                            offset: entry_offset + item_offset,
                            len: read_size,
                        },
                        ItemState::PopulatedWithoutQuota,
                    ));
                }
                DataElement::Blob { .. } => {
                    // References are flattened one level before slicing.
                    return Err(BlobError::InvalidConstructionArguments);
                }
            }
        }

        remaining -= read_size;
        item_offset = 0;
        if remaining == 0 {
            break;
        }
    }

    Ok(result)
}
