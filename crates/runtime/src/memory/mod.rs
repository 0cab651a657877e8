//! Long-term memory: vector recall, episodes, and the knowledge base.

pub mod episodes;
pub mod knowledge;
pub mod vector_index;

pub use episodes::EpisodicMemory;
pub use knowledge::KnowledgeStore;
pub use vector_index::{NewMemory, ScoredMemory, SearchOptions, VectorIndex};
