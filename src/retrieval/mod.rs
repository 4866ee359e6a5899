//! 检索层：分块、向量索引、检索器与证据聚合

pub mod aggregator;
pub mod chunker;
pub mod index;
pub mod retriever;

pub use aggregator::{AggregatorConfig, EvidenceAggregator};
pub use chunker::{Chunker, ChunkingConfig};
pub use index::{IndexRetriever, SharedIndex, VectorIndex};
pub use retriever::{HttpRetriever, RetrievalError, RetrievedChunk, Retriever};
