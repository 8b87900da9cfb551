pub mod blob;
pub mod files;
pub mod state;
pub mod vector;

pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use files::{FileRecord, FileStore, MemoryFileStore, ProcessingStatus};
pub use state::{MemoryStateStore, StateManager, StateStore};
pub use vector::{MemoryVectorStore, VectorDoc, VectorIndex, VectorStore};
