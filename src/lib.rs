//! In-process blob storage with bounded memory and disk budgets.
//!
//! Blobs are immutable sequences of bytes assembled from heterogeneous
//! sources: caller-supplied bytes, files, sandboxed-filesystem URLs, disk
//! cache entries and ranges of other blobs. Construction runs through a
//! small pipeline: a [`BlobDataBuilder`] describes the input, the storage
//! context flattens it into refcounted shareable items, memory quota is
//! granted in FIFO order against a fixed budget, externally delivered
//! bytes arrive during a transport phase, and the finished blob becomes
//! readable through snapshots. Under memory pressure, populated bytes are
//! paged out to disk-backed page files and transparently swapped back in
//! as file-backed items.
//!
//! ```no_run
//! use blobstore::{BlobDataBuilder, BlobStorage, StorageLimits};
//!
//! # #[tokio::main]
//! # async fn main() -> blobstore::Result<()> {
//! let storage = BlobStorage::new(StorageLimits::new("/tmp/blobs"));
//! let mut builder = BlobDataBuilder::new();
//! builder.set_content_type("text/plain");
//! builder.append_data(b"hello".to_vec());
//! let handle = storage.add_finished_blob(builder)?;
//! let snapshot = storage.snapshot(handle.uuid()).expect("finished blob");
//! assert_eq!(snapshot.total_size, 5);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod item;

mod controller;
mod flattener;
mod registry;
mod slicer;

pub use builder::BlobDataBuilder;
pub use config::StorageLimits;
pub use context::{
    BlobHandle, BlobStorage, CompletionCallback, TransportCallback, TransportItemInfo,
    TransportItemKind, TransportRequest,
};
pub use controller::TransportStrategy;
pub use entry::{BlobError, BlobSnapshot, BlobStatus};
pub use error::{Error, Result};
pub use item::{DataElement, FileHandle, PageFileRef, WriteMap, UNKNOWN_SIZE};
