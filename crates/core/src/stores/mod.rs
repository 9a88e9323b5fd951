pub mod fs;
pub mod memory;
pub mod qdrant;

pub use fs::{discover_document_files, FsBlobStorage};
pub use memory::{MemoryBlobStorage, MemoryRepository, MemoryVectorIndex};
pub use qdrant::QdrantIndex;

pub(crate) fn relevance_from_distance(distance: f32) -> f32 {
    let normalized = (distance / 2.0).clamp(0.0, 1.0);
    (1.0 - normalized).clamp(0.0, 1.0)
}
