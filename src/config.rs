use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Budgets and thresholds for the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLimits {
    /// Directory for page files and transport files (default: "./blob_storage")
    pub storage_dir: PathBuf,

    /// Largest transport that fits inline in a request (default: 250KB)
    pub max_ipc_memory_size: u64,

    /// Segment size for shared-memory transport (default: 10MB)
    pub max_shared_memory_size: u64,

    /// Total in-memory budget across all blobs (default: 500MB)
    pub max_blob_memory_space: u64,

    /// Total on-disk budget for page and transport files (default: 1GB)
    pub effective_max_disk_space: u64,

    /// Smallest batch of evicted bytes worth one page file (default: 5MB)
    pub min_page_file_size: u64,

    /// Whether populated memory may be paged out to disk (default: true)
    pub file_paging_enabled: bool,
}

impl StorageLimits {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Memory usage above this mark schedules eviction. Keeping one
    /// minimum-sized page file of headroom avoids writing page files
    /// smaller than `min_page_file_size`.
    pub fn memory_limit_before_paging(&self) -> u64 {
        self.max_blob_memory_space
            .saturating_sub(self.min_page_file_size)
    }

    /// Largest size that could ever be granted, across both budgets.
    pub fn total_capacity(&self) -> u64 {
        if self.file_paging_enabled {
            self.max_blob_memory_space
                .saturating_add(self.effective_max_disk_space)
        } else {
            self.max_blob_memory_space
        }
    }
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./blob_storage"),
            max_ipc_memory_size: 250 * 1024,
            max_shared_memory_size: 10 * 1024 * 1024,
            max_blob_memory_space: 500 * 1024 * 1024,
            effective_max_disk_space: 1024 * 1024 * 1024,
            min_page_file_size: 5 * 1024 * 1024,
            file_paging_enabled: true,
        }
    }
}
