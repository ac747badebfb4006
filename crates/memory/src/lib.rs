pub mod chunk;
pub mod error;
pub mod extractor;
pub mod forgetting;
pub mod fusion;
pub mod retrieval;
pub mod store;
pub mod system;

pub use chunk::{
    ConfidenceLevel, GLOBAL_SCOPE, ImportanceLevel, MemoryChunk, MemoryContent, MemoryType,
    ObjectValue, cosine_similarity,
};
pub use error::MemoryError;
pub use extractor::{ConversationContext, MemoryExtractor, MessageKind};
pub use forgetting::{ForgettingReport, MemoryForgetter};
pub use fusion::{MemoryFusion, content_fingerprint};
pub use retrieval::{Emphasis, MemoryRetriever, QueryPlan, RecencyPreference};
pub use store::{
    InMemoryVectorStore, MemoryStore, MetadataFilter, RecordSelector, VectorMatch, VectorRecord,
    VectorStore,
};
pub use system::{IngestRequest, MemorySystem, MemorySystemStatus, RetrieveContext};
