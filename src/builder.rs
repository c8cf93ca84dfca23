use std::path::PathBuf;
use std::time::SystemTime;

use url::Url;
use uuid::Uuid;

use crate::item::{WriteMap, UNKNOWN_SIZE};

/// Raw input for one blob item, before flattening resolves it into a
/// shareable item.
#[derive(Debug, Clone)]
pub(crate) enum BuilderItem {
    Bytes(Vec<u8>),
    FutureBytes {
        len: u64,
        buf: Option<Vec<u8>>,
        written: WriteMap,
    },
    File {
        path: PathBuf,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    },
    FutureFile {
        offset: u64,
        len: u64,
        file_id: u64,
    },
    FileSystemUrl {
        url: Url,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    },
    DiskCacheEntry {
        handle: u64,
        stream: i32,
        side_stream: i32,
        offset: u64,
        len: u64,
    },
    Blob {
        uuid: Uuid,
        offset: u64,
        len: u64,
    },
}

/// Assembles the item list for one blob. Future items are placeholders the
/// caller populates later, either here before building or through the
/// storage context during the transport phase.
pub struct BlobDataBuilder {
    uuid: Uuid,
    content_type: String,
    content_disposition: String,
    items: Vec<BuilderItem>,
}

impl BlobDataBuilder {
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            content_type: String::new(),
            content_disposition: String::new(),
            items: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn set_content_disposition(&mut self, content_disposition: impl Into<String>) {
        self.content_disposition = content_disposition.into();
    }

    pub fn append_data(&mut self, data: impl Into<Vec<u8>>) {
        self.items.push(BuilderItem::Bytes(data.into()));
    }

    /// Appends a placeholder for `len` bytes delivered later. Returns the
    /// future-data index used by the populate calls.
    pub fn append_future_data(&mut self, len: u64) -> usize {
        let index = self.future_data_count();
        self.items.push(BuilderItem::FutureBytes {
            len,
            buf: None,
            written: WriteMap::default(),
        });
        index
    }

    /// Copies `data` into future-data slot `index` at `offset`. Returns
    /// false on an unknown index or an out-of-range write.
    pub fn populate_future_data(&mut self, index: usize, data: &[u8], offset: u64) -> bool {
        let Some(BuilderItem::FutureBytes { len, buf, written }) =
            self.nth_future_data_mut(index)
        else {
            return false;
        };
        let len = *len;
        let end = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= len => end,
            _ => return false,
        };
        let buf = buf.get_or_insert_with(|| vec![0; len as usize]);
        buf[offset as usize..end as usize].copy_from_slice(data);
        written.insert(offset, end);
        true
    }

    pub fn append_file(
        &mut self,
        path: impl Into<PathBuf>,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    ) {
        self.items.push(BuilderItem::File {
            path: path.into(),
            offset,
            len,
            mtime,
        });
    }

    /// Appends a placeholder for `len` bytes at `offset` of transport
    /// file `file_id`. Slots sharing a file id are delivered through one
    /// transport file. Returns the future-file index used by the populate
    /// calls.
    pub fn append_future_file(&mut self, offset: u64, len: u64, file_id: u64) -> usize {
        let index = self.future_file_count();
        self.items.push(BuilderItem::FutureFile {
            offset,
            len,
            file_id,
        });
        index
    }

    /// Replaces future-file slot `index` with a real file, for callers
    /// that resolve the file before building. Returns false on an unknown
    /// index.
    pub fn populate_future_file(
        &mut self,
        index: usize,
        path: impl Into<PathBuf>,
        mtime: Option<SystemTime>,
    ) -> bool {
        let mut seen = 0;
        for item in self.items.iter_mut() {
            if let BuilderItem::FutureFile { offset, len, .. } = item {
                if seen == index {
                    *item = BuilderItem::File {
                        path: path.into(),
                        offset: *offset,
                        len: *len,
                        mtime,
                    };
                    return true;
                }
                seen += 1;
            }
        }
        false
    }

    /// References the full extent of another blob.
    pub fn append_blob(&mut self, uuid: Uuid) {
        self.append_blob_range(uuid, 0, UNKNOWN_SIZE);
    }

    /// References a byte range of another blob. `UNKNOWN_SIZE` means
    /// "through the end of the target".
    pub fn append_blob_range(&mut self, uuid: Uuid, offset: u64, len: u64) {
        self.items.push(BuilderItem::Blob { uuid, offset, len });
    }

    pub fn append_file_system_url(
        &mut self,
        url: Url,
        offset: u64,
        len: u64,
        mtime: Option<SystemTime>,
    ) {
        self.items.push(BuilderItem::FileSystemUrl {
            url,
            offset,
            len,
            mtime,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_disk_cache_entry(
        &mut self,
        handle: u64,
        stream: i32,
        side_stream: i32,
        offset: u64,
        len: u64,
    ) {
        self.items.push(BuilderItem::DiskCacheEntry {
            handle,
            stream,
            side_stream,
            offset,
            len,
        });
    }

    /// True when every future slot has been fully populated.
    pub fn is_fully_populated(&self) -> bool {
        self.items.iter().all(|item| match item {
            BuilderItem::FutureBytes { len, written, .. } => written.covers(*len),
            BuilderItem::FutureFile { .. } => false,
            _ => true,
        })
    }

    pub(crate) fn into_parts(self) -> (Uuid, String, String, Vec<BuilderItem>) {
        (
            self.uuid,
            self.content_type,
            self.content_disposition,
            self.items,
        )
    }

    fn future_data_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, BuilderItem::FutureBytes { .. }))
            .count()
    }

    fn future_file_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, BuilderItem::FutureFile { .. }))
            .count()
    }

    fn nth_future_data_mut(&mut self, index: usize) -> Option<&mut BuilderItem> {
        self.items
            .iter_mut()
            .filter(|item| matches!(item, BuilderItem::FutureBytes { .. }))
            .nth(index)
    }
}

impl Default for BlobDataBuilder {
    fn default() -> Self {
        Self::new()
    }
}
