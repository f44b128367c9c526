pub mod relocate;
pub mod storage;

pub use relocate::{AssetRelocator, HttpFetcher, RelocationReport, RelocatorSettings};
pub use storage::{ObjectStore, S3Store, StorageConfig};
