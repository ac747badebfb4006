use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The model's extraction response could not be parsed even after
    /// repair. Non-fatal: the ingest pipeline returns empty.
    #[error("extraction response unparseable: {0}")]
    ExtractionParse(String),

    /// A produced chunk violated the contract (empty subjects, bad
    /// length, …) and was dropped.
    #[error("invalid memory chunk: {0}")]
    InvalidChunk(String),

    /// The configured embedding dimension disagrees with the provider.
    #[error("embedding dimension mismatch: configured {configured}, provider {provider}")]
    DimensionMismatch { configured: usize, provider: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
